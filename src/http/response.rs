use crate::config::ServerConfig;
use crate::http::uri::HtmlEscaped;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::time::SystemTime;

pub const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    /// Reason phrase override, used when a CGI script supplies its own.
    pub reason: Option<String>,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        let mut response = Self::new(status);
        response.set_header("Content-Type", content_type);
        response.body = body;
        response
    }

    pub fn html(status: u16, body: String) -> Self {
        Self::with_body(status, "text/html; charset=utf-8", body.into_bytes())
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        let body = format!(
            "<html><head><title>{code} {reason}</title></head>\
             <body><h1>{reason}</h1><p>Moved to <a href=\"{to}\">{to}</a></p></body></html>\n",
            code = status,
            reason = reason_phrase(status),
            to = HtmlEscaped(location),
        );
        let mut response = Self::html(status, body);
        response.set_header("Location", location);
        response
    }

    /// Error response for `status`, using the server's `error_page` when one
    /// is configured and readable.
    pub fn error(server: Option<&ServerConfig>, status: u16) -> Self {
        if let Some(server) = server {
            if let Some(page) = server.error_pages.get(&status) {
                let path = server.root.join(page.trim_start_matches('/'));
                match fs::read(&path) {
                    Ok(body) => {
                        let content_type = crate::handlers::static_files::content_type(&path);
                        return Self::with_body(status, content_type, body);
                    }
                    Err(e) => log::warn!(
                        "error page {} for {} could not be read: {}",
                        path.display(),
                        status,
                        e
                    ),
                }
            }
        }
        Self::html(status, default_error_body(status))
    }

    /// Replace any header with the same name, ignoring case.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Append without replacing, for headers that may repeat.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Serialize status line, headers and body. Framing headers are always
    /// generated here so every response carries an exact Content-Length.
    pub fn serialize(&self, keep_alive: bool) -> Vec<u8> {
        let reason = self.reason.as_deref().unwrap_or(reason_phrase(self.status));
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nDate: {}\r\nServer: {}\r\n",
            self.status,
            reason,
            HttpDate(SystemTime::now()),
            SERVER_SOFTWARE
        );
        for (name, value) in self.headers() {
            if is_framing_header(name) {
                continue;
            }
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: {}\r\n\r\n",
            self.body.len(),
            if keep_alive { "keep-alive" } else { "close" }
        ));

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn is_framing_header(name: &str) -> bool {
    ["content-length", "connection", "transfer-encoding", "date", "server"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

fn default_error_body(status: u16) -> String {
    let reason = reason_phrase(status);
    format!(
        "<html><head><title>{code} {reason}</title></head>\
         <body style='font-family:sans-serif; text-align:center; padding-top:50px;'>\
         <h1>{code} {reason}</h1><hr><p>{server}</p></body></html>\n",
        code = status,
        reason = reason,
        server = SERVER_SOFTWARE
    )
}
