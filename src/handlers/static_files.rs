use super::{HandlerResult, autoindex, io_status};
use crate::http::response::{HttpDate, Response};
use crate::router::is_contained;
use std::fs;
use std::path::Path;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const EXTENSIONS_MAP: &[(&str, &[&str])] = &[
    ("application/json", &["json"]),
    ("application/ogg", &["ogg"]),
    ("application/pdf", &["pdf"]),
    ("application/wasm", &["wasm"]),
    ("application/xml", &["xsl", "xml"]),
    ("application/zip", &["zip"]),
    ("audio/mpeg", &["mp2", "mp3", "mpga"]),
    ("image/gif", &["gif"]),
    ("image/jpeg", &["jpeg", "jpe", "jpg"]),
    ("image/png", &["png"]),
    ("image/svg+xml", &["svg"]),
    ("image/x-icon", &["ico"]),
    ("text/css", &["css"]),
    ("text/html", &["html", "htm"]),
    ("text/javascript", &["js"]),
    ("text/plain", &["txt", "asc"]),
    ("video/mp4", &["mp4"]),
    ("video/mpeg", &["mpeg", "mpe", "mpg"]),
];

/// Content type by file extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(e) => e.to_ascii_lowercase(),
        None => return DEFAULT_MIME_TYPE,
    };
    EXTENSIONS_MAP
        .iter()
        .find(|(_, exts)| exts.contains(&ext.as_str()))
        .map_or(DEFAULT_MIME_TYPE, |(mime, _)| *mime)
}

/// Answer a GET for `path`, which `url_path` names on the wire.
pub fn serve(
    root: &Path,
    path: &Path,
    url_path: &str,
    index: &str,
    autoindex: bool,
) -> HandlerResult {
    let metadata = fs::metadata(path).map_err(|e| io_status(&e))?;
    if !is_contained(root, path) {
        log::warn!("{} resolves outside {}", path.display(), root.display());
        return Err(403);
    }

    if !metadata.is_dir() {
        return serve_file(path);
    }

    if !url_path.ends_with('/') {
        return Ok(Response::redirect(301, &format!("{}/", url_path)));
    }

    let index_path = path.join(index);
    if index_path.is_file() {
        return serve_file(&index_path);
    }
    if autoindex {
        return autoindex::render(path, url_path);
    }
    Err(403)
}

fn serve_file(path: &Path) -> HandlerResult {
    let body = fs::read(path).map_err(|e| io_status(&e))?;
    let mut response = Response::with_body(200, content_type(path), body);
    if let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) {
        response.set_header("Last-Modified", &HttpDate(modified).to_string());
    }
    Ok(response)
}
