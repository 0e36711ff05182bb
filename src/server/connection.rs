use crate::http::parser::RequestParser;
use crate::server::cgi::CgiProcess;
use mio::Token;
use mio::net::TcpStream;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ReadRequest,
    /// A CGI child is producing the response.
    AwaitCgi,
    WriteResponse,
    /// Final response sent and the write side shut down. Input is read and
    /// discarded until the peer closes.
    Linger,
}

pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Listener that accepted this connection.
    pub listener: Token,
    pub state: ConnectionState,
    pub parser: RequestParser,
    pub read_buffer: Vec<u8>,
    pub write_buffer: Vec<u8>,
    pub bytes_written: usize,
    pub last_activity: Instant,
    /// Server block answering the current request.
    pub server_idx: usize,
    pub keep_alive: bool,
    /// Request line of the current request, for the access log.
    pub request_line: String,
    pub cgi: Option<CgiProcess>,
    /// Bytes thrown away while lingering.
    pub discarded: usize,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        listener: Token,
        server_idx: usize,
        max_header_size: usize,
    ) -> Self {
        Self {
            stream,
            peer,
            listener,
            state: ConnectionState::ReadRequest,
            parser: RequestParser::new(max_header_size),
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::new(),
            bytes_written: 0,
            last_activity: Instant::now(),
            server_idx,
            keep_alive: false,
            request_line: String::from("-"),
            cgi: None,
            discarded: 0,
        }
    }

    /// Get ready for the next request, keeping pipelined bytes already
    /// sitting in `read_buffer`.
    pub fn reset_for_next_request(&mut self) {
        self.parser.reset();
        self.write_buffer.clear();
        self.bytes_written = 0;
        self.keep_alive = false;
        self.request_line = String::from("-");
        self.state = ConnectionState::ReadRequest;
        self.last_activity = Instant::now();
    }
}
