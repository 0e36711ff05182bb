use std::io;
use std::net::SocketAddr;

/// Problems found while loading the configuration file. All of them are
/// fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not open config file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("empty config")]
    Empty,
    #[error("no server block defined")]
    NoServers,
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: unknown directive `{directive}`")]
    UnknownDirective { line: usize, directive: String },
    #[error("line {line}: invalid value for `{directive}`: {value}")]
    InvalidValue {
        line: usize,
        directive: String,
        value: String,
    },
    #[error("server block {index}: missing `{directive}`")]
    MissingDirective {
        index: usize,
        directive: &'static str,
    },
    #[error("server name `{name}` is defined twice on {host}:{port}")]
    DuplicateServer { host: String, port: u16, name: String },
}

/// Process-fatal failures while bringing the reactor up.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to create poll instance: {0}")]
    Poll(#[source] io::Error),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to register listener {addr}: {source}")]
    Register {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Per-request protocol failures. Each one maps to the status code sent
/// back before the connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request: {0}")]
    BadRequest(&'static str),
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("request head exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },
    #[error("unsupported transfer coding `{0}`")]
    UnsupportedEncoding(String),
    #[error("unsupported protocol version `{0}`")]
    UnsupportedVersion(String),
}

impl ParseError {
    pub fn status(&self) -> u16 {
        match self {
            ParseError::BadRequest(_) => 400,
            ParseError::PayloadTooLarge { .. } => 413,
            ParseError::HeadersTooLarge { .. } => 431,
            ParseError::UnsupportedEncoding(_) => 501,
            ParseError::UnsupportedVersion(_) => 505,
        }
    }
}

/// Reasons a CGI execution ends in a 500.
#[derive(Debug, thiserror::Error)]
pub enum CgiError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("pipe setup failed: {0}")]
    Pipe(#[source] io::Error),
    #[error("script exited with {0}")]
    ExitStatus(std::process::ExitStatus),
    #[error("script exceeded its {0}s deadline")]
    Timeout(u64),
    #[error("malformed script output: {0}")]
    MalformedOutput(&'static str),
    #[error("script output exceeds {0} bytes")]
    OutputTooLarge(usize),
}
