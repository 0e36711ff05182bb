use crate::http::request::Method;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_CLIENTS: usize = 100;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CGI_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_INDEX: &str = "index.html";

#[derive(Debug, Clone)]
pub struct Location {
    pub path: String,
    pub methods: Vec<Method>,
    pub root: Option<PathBuf>,
    pub index: Option<String>,
    pub autoindex: bool,
    pub upload_dir: Option<PathBuf>,
    /// Extension (with the leading dot) to interpreter. `None` runs the
    /// script directly.
    pub cgi: HashMap<String, Option<PathBuf>>,
    pub redirect: Option<String>,
}

impl Location {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            methods: vec![Method::Get],
            root: None,
            index: None,
            autoindex: false,
            upload_dir: None,
            cgi: HashMap::new(),
            redirect: None,
        }
    }

    /// Whether `path` falls under this location. Matching stops on segment
    /// boundaries, so `/img` covers `/img/a.png` but not `/images`.
    pub fn matches(&self, path: &str) -> bool {
        if self.path == "/" {
            return path.starts_with('/');
        }
        let prefix = self.path.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn interpreter_for(&self, extension: &str) -> Option<&Option<PathBuf>> {
        self.cgi.get(extension)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub server_names: Vec<String>,
    pub root: PathBuf,
    pub index: String,
    pub client_max_body_size: usize,
    pub error_pages: HashMap<u16, String>,
    pub locations: Vec<Location>,
}

impl ServerConfig {
    pub fn answers_to(&self, host: &str) -> bool {
        self.server_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(host))
    }

    pub fn primary_name(&self) -> &str {
        self.server_names.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    pub max_clients: usize,
    pub timeout: Duration,
    pub cgi_timeout: Duration,
    pub keep_alive: bool,
    pub max_header_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            max_clients: DEFAULT_MAX_CLIENTS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            cgi_timeout: Duration::from_secs(DEFAULT_CGI_TIMEOUT_SECS),
            keep_alive: true,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }
}
