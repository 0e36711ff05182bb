pub mod autoindex;
pub mod cgi;
pub mod delete;
pub mod static_files;
pub mod upload;

use crate::http::response::Response;
use std::io;

/// Handlers either build a response or name the error status the caller
/// should render with the server's error pages.
pub type HandlerResult = Result<Response, u16>;

pub fn io_status(err: &io::Error) -> u16 {
    match err.kind() {
        io::ErrorKind::NotFound => 404,
        io::ErrorKind::PermissionDenied => 403,
        _ => 500,
    }
}
