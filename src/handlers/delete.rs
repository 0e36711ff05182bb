use super::{HandlerResult, io_status};
use crate::http::response::Response;
use crate::http::uri::HtmlEscaped;
use crate::router::is_contained;
use std::fs;
use std::path::Path;

/// Remove the regular file at `path`. Directories are never removed.
pub fn remove(root: &Path, path: &Path, url_path: &str) -> HandlerResult {
    let metadata = fs::symlink_metadata(path).map_err(|e| io_status(&e))?;
    if metadata.is_dir() || !is_contained(root, path) {
        return Err(403);
    }

    fs::remove_file(path).map_err(|e| {
        log::warn!("couldn't delete {}: {}", path.display(), e);
        io_status(&e)
    })?;
    log::debug!("deleted {}", path.display());

    Ok(Response::html(
        200,
        format!(
            "<html><body><h1>File deleted</h1><p>{}</p></body></html>\n",
            HtmlEscaped(url_path)
        ),
    ))
}
