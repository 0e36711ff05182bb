use super::HandlerResult;
use crate::http::request::HttpRequest;
use crate::http::response::Response;
use crate::http::uri::HtmlEscaped;
use std::fs;
use std::path::Path;

#[derive(Debug, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Store the request body under `dir`. `multipart/form-data` bodies save
/// every file part under its own name; anything else is written as-is to
/// `file_name`.
pub fn store(dir: &Path, file_name: Option<&str>, request: &HttpRequest) -> HandlerResult {
    let files = match request.content_type() {
        Some(ct) if ct.to_ascii_lowercase().starts_with("multipart/form-data") => {
            let files = parse_multipart(ct, &request.body).ok_or(400u16)?;
            if files.is_empty() {
                return Err(400);
            }
            files
        }
        _ => vec![UploadedFile {
            file_name: file_name.ok_or(400u16)?.to_string(),
            data: request.body.clone(),
        }],
    };

    fs::create_dir_all(dir).map_err(|e| {
        log::warn!("couldn't create upload dir {}: {}", dir.display(), e);
        500u16
    })?;

    let mut saved = Vec::with_capacity(files.len());
    for file in &files {
        let dest = dir.join(&file.file_name);
        fs::write(&dest, &file.data).map_err(|e| {
            log::warn!("upload to {} failed: {}", dest.display(), e);
            500u16
        })?;
        log::debug!("stored {} bytes at {}", file.data.len(), dest.display());
        saved.push(file.file_name.as_str());
    }

    let items: String = saved
        .iter()
        .map(|name| format!("<li>{}</li>", HtmlEscaped(name)))
        .collect();
    Ok(Response::html(
        200,
        format!("<html><body><h1>Upload complete</h1><ul>{}</ul></body></html>\n", items),
    ))
}

/// Split a multipart body into its file parts. Returns `None` when the
/// content type carries no boundary or a file part has an unusable name.
/// Parts without a `filename` (plain form fields) are skipped.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> Option<Vec<UploadedFile>> {
    let boundary = content_type
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim_matches('"'))?;
    if boundary.is_empty() {
        return None;
    }
    let delimiter = format!("--{}", boundary).into_bytes();

    let mut files = Vec::new();
    let mut pos = find_bytes(body, &delimiter, 0)?;
    loop {
        let part_start = pos + delimiter.len();
        if body[part_start..].starts_with(b"--") {
            break;
        }
        let part_end = match find_bytes(body, &delimiter, part_start) {
            Some(end) => end,
            None => break,
        };
        if let Some(file) = parse_part(&body[part_start..part_end])? {
            files.push(file);
        }
        pos = part_end;
    }
    Some(files)
}

/// `Some(None)` for a part without a file, `None` for a malformed one.
fn parse_part(part: &[u8]) -> Option<Option<UploadedFile>> {
    let part = part.strip_prefix(b"\r\n").unwrap_or(part);
    let head_end = find_bytes(part, b"\r\n\r\n", 0)?;
    let head = std::str::from_utf8(&part[..head_end]).ok()?;
    let data = &part[head_end + 4..];
    let data = data.strip_suffix(b"\r\n").unwrap_or(data);

    let disposition = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-disposition")
            .then_some(value)
    })?;
    let raw_name = match disposition
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("filename"))
    {
        Some((_, value)) => value.trim_matches('"'),
        None => return Some(None),
    };

    let file_name = sanitize_file_name(raw_name)?;
    Some(Some(UploadedFile {
        file_name,
        data: data.to_vec(),
    }))
}

/// Final path component of a client-supplied name, rejecting empty and
/// dot names.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next()?;
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    haystack
        .get(start..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + start)
}
