pub mod cgi;
pub mod connection;
pub mod listener;

use crate::config::Config;
use crate::error::{CgiError, ParseError, ServerError};
use crate::handlers::{self, HandlerResult, delete, static_files, upload};
use crate::http::request::HttpRequest;
use crate::http::response::Response;
use crate::router::{self, CgiTarget, Route};
use crate::server::cgi::{CgiProcess, PipeKind};
use crate::server::connection::{Connection, ConnectionState};
use crate::server::listener::Listener;

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

const IDLE_TICK: Duration = Duration::from_millis(1000);
/// Poll timeout while a CGI child is running, so exits and deadlines are
/// noticed without waiting for socket traffic.
const CGI_TICK: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 8192;
/// How long and how much unread input a closing connection may still drain.
const LINGER_TIMEOUT: Duration = Duration::from_secs(2);
const LINGER_LIMIT: usize = 1024 * 1024;

pub struct Server {
    poll: Poll,
    listeners: HashMap<Token, Listener>,
    connections: HashMap<Token, Connection>,
    /// CGI pipe token to the connection that owns it.
    pipes: HashMap<Token, (Token, PipeKind)>,
    /// Connections whose response is flushed and whose buffered bytes may
    /// already hold the next request.
    resume: VecDeque<Token>,
    config: Config,
    next_token: usize,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        Ok(Self {
            poll: Poll::new().map_err(ServerError::Poll)?,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            pipes: HashMap::new(),
            resume: VecDeque::new(),
            config,
            next_token: 0,
        })
    }

    /// Bind one listener per distinct `host:port`. Any failure is fatal.
    pub fn bind(&mut self) -> Result<(), ServerError> {
        for mut listener in listener::bind_all(&self.config)? {
            let token = self.next_token();
            self.poll
                .registry()
                .register(&mut listener.socket, token, Interest::READABLE)
                .map_err(|source| ServerError::Register {
                    addr: listener.addr,
                    source,
                })?;

            let names: Vec<&str> = listener
                .servers
                .iter()
                .map(|&idx| self.config.servers[idx].primary_name())
                .collect();
            log::info!("listening on http://{} [{}]", listener.addr, names.join(", "));
            self.listeners.insert(token, listener);
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(1024);
        log::info!(
            "event loop started (max_clients {}, timeout {}s, cgi_timeout {}s)",
            self.config.max_clients,
            self.config.timeout.as_secs(),
            self.config.cgi_timeout.as_secs()
        );

        loop {
            let tick = if self.connections.values().any(|c| c.cgi.is_some()) {
                CGI_TICK
            } else {
                IDLE_TICK
            };
            if let Err(e) = self.poll.poll(&mut events, Some(tick)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Poll(e));
            }

            for event in events.iter() {
                let token = event.token();
                if self.listeners.contains_key(&token) {
                    self.accept_connections(token);
                } else if let Some(&(owner, kind)) = self.pipes.get(&token) {
                    self.pump_cgi(owner, Some(kind));
                } else {
                    self.handle_client_event(token, event);
                }
            }

            self.check_cgi();
            self.check_timeouts();
            while let Some(token) = self.resume.pop_front() {
                self.read_from_client(token);
            }
        }
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn handle_client_event(&mut self, token: Token, event: &Event) {
        if event.is_readable() || event.is_read_closed() {
            let lingering = self
                .connections
                .get(&token)
                .is_some_and(|c| c.state == ConnectionState::Linger);
            if lingering {
                self.drain(token);
            } else {
                self.read_from_client(token);
            }
        }
        if event.is_writable() {
            self.write_to_client(token);
        }
        if event.is_error() {
            log::debug!("socket error on {:?}", token);
            self.close_connection(token);
        }
    }

    fn accept_connections(&mut self, listener_token: Token) {
        loop {
            let accepted = match self.listeners.get(&listener_token) {
                Some(listener) => listener.socket.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => self.admit(listener_token, stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn admit(&mut self, listener_token: Token, mut stream: TcpStream, peer: SocketAddr) {
        let server_idx = self
            .listeners
            .get(&listener_token)
            .and_then(|l| l.servers.first().copied())
            .unwrap_or(0);

        if self.connections.len() >= self.config.max_clients {
            log::warn!(
                "rejecting {}: {} clients already connected",
                peer,
                self.connections.len()
            );
            let response = Response::error(self.config.servers.get(server_idx), 503);
            let _ = stream.write_all(&response.serialize(false));
            return;
        }

        let token = self.next_token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            log::warn!("failed to register {}: {}", peer, e);
            return;
        }
        log::debug!("accepted {} as {:?}", peer, token);
        self.connections.insert(
            token,
            Connection::new(
                stream,
                peer,
                listener_token,
                server_idx,
                self.config.max_header_size,
            ),
        );
    }

    /// Parse whatever is buffered, then keep reading until a request is
    /// complete or the socket would block.
    fn read_from_client(&mut self, token: Token) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.parse_buffered(token) {
                Some(Ok(request)) => return self.process_request(token, request),
                Some(Err(e)) => return self.reject(token, e),
                None => {}
            }

            let conn = match self.connections.get_mut(&token) {
                Some(c) if c.state == ConnectionState::ReadRequest => c,
                _ => return,
            };
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    if conn.parser.in_progress() {
                        log::debug!("{} closed mid-request ({:?})", conn.peer, conn.parser.state());
                    }
                    self.close_connection(token);
                    return;
                }
                Ok(n) => {
                    conn.read_buffer.extend_from_slice(&buf[..n]);
                    conn.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("read from {} failed: {}", conn.peer, e);
                    self.close_connection(token);
                    return;
                }
            }
        }
    }

    fn parse_buffered(&mut self, token: Token) -> Option<Result<HttpRequest, ParseError>> {
        let conn = self.connections.get_mut(&token)?;
        if conn.state != ConnectionState::ReadRequest || conn.read_buffer.is_empty() {
            return None;
        }

        let config = &self.config;
        let candidates: &[usize] = self
            .listeners
            .get(&conn.listener)
            .map_or(&[][..], |l| l.servers.as_slice());
        let body_limit = |request: &HttpRequest| {
            let idx = router::select_server(config, candidates, request.host());
            config.servers[idx].client_max_body_size
        };
        conn.parser
            .parse(&mut conn.read_buffer, &body_limit)
            .transpose()
    }

    fn process_request(&mut self, token: Token, request: HttpRequest) {
        let (listener, peer) = match self.connections.get(&token) {
            Some(c) => (c.listener, c.peer),
            None => return,
        };
        let candidates = self
            .listeners
            .get(&listener)
            .map(|l| l.servers.clone())
            .unwrap_or_default();
        let server_idx = router::select_server(&self.config, &candidates, request.host());
        let keep_alive = self.config.keep_alive && request.wants_keep_alive();

        if let Some(conn) = self.connections.get_mut(&token) {
            conn.server_idx = server_idx;
            conn.keep_alive = keep_alive;
            conn.request_line = format!(
                "{} {} {}",
                request.method,
                request.target,
                request.version.as_str()
            );
        }

        let server = &self.config.servers[server_idx];
        let result: HandlerResult = match router::route(server, &request) {
            Route::Static {
                root,
                path,
                url_path,
                index,
                autoindex,
            } => static_files::serve(&root, &path, &url_path, &index, autoindex),
            Route::Upload { dir, file_name } => {
                upload::store(&dir, file_name.as_deref(), &request)
            }
            Route::Delete { root, path } => delete::remove(&root, &path, &request.path),
            Route::Redirect(location) => Ok(Response::redirect(301, &location)),
            Route::MethodNotAllowed(allowed) => {
                let mut response = Response::error(Some(server), 405);
                let allow: Vec<&str> = allowed.iter().map(|m| m.as_str()).collect();
                response.set_header("Allow", &allow.join(", "));
                Ok(response)
            }
            Route::Error(status) => Err(status),
            Route::Cgi(target) => return self.start_cgi(token, server_idx, &target, request, peer),
        };

        let response = result.unwrap_or_else(|status| Response::error(Some(server), status));
        self.finalize_response(token, response);
    }

    /// Answer a request that failed to parse, then close.
    fn reject(&mut self, token: Token, err: ParseError) {
        let server_idx = match self.connections.get_mut(&token) {
            Some(conn) => {
                log::warn!("bad request from {}: {}", conn.peer, err);
                conn.keep_alive = false;
                conn.server_idx
            }
            None => return,
        };
        let response = Response::error(self.config.servers.get(server_idx), err.status());
        self.finalize_response(token, response);
    }

    fn start_cgi(
        &mut self,
        token: Token,
        server_idx: usize,
        target: &CgiTarget,
        request: HttpRequest,
        peer: SocketAddr,
    ) {
        let server = &self.config.servers[server_idx];
        let env = handlers::cgi::build_env(target, &request, server, peer);
        let timeout = self.config.cgi_timeout;
        let mut process = match CgiProcess::start(target, env, request.body, timeout) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("{}: {}", target.script.display(), e);
                let response = Response::error(Some(server), 500);
                return self.finalize_response(token, response);
            }
        };

        let stdin_token = self.next_token();
        let stdout_token = self.next_token();
        if let Err(e) = process.register(self.poll.registry(), stdin_token, stdout_token) {
            log::warn!("failed to register CGI pipes: {}", e);
            process.deregister(self.poll.registry());
            let response = Response::error(self.config.servers.get(server_idx), 500);
            return self.finalize_response(token, response);
        }
        log::debug!(
            "started {} (pid {}) for {:?}",
            target.script.display(),
            process.pid(),
            token
        );

        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return process.deregister(self.poll.registry()),
        };
        self.pipes.insert(stdin_token, (token, PipeKind::Stdin));
        self.pipes.insert(stdout_token, (token, PipeKind::Stdout));
        conn.state = ConnectionState::AwaitCgi;
        conn.last_activity = Instant::now();
        conn.cgi = Some(process);
        self.pump_cgi(token, None);
    }

    /// Move data through the CGI pipes and finish the response once the
    /// child is done.
    fn pump_cgi(&mut self, token: Token, kind: Option<PipeKind>) {
        let registry = self.poll.registry();
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };
        let process = match conn.cgi.as_mut() {
            Some(p) => p,
            None => return,
        };

        let io_result = match kind {
            Some(PipeKind::Stdin) => process.write_input(registry),
            Some(PipeKind::Stdout) => process.read_output(registry),
            None => process
                .write_input(registry)
                .and_then(|_| process.read_output(registry)),
        };
        conn.last_activity = Instant::now();

        let outcome = match io_result {
            Ok(()) => process.try_finish(),
            Err(e) => Some(Err(CgiError::Pipe(e))),
        };
        if let Some(result) = outcome {
            self.complete_cgi(token, result);
        }
    }

    fn complete_cgi(&mut self, token: Token, result: Result<Response, CgiError>) {
        let server_idx = match self.connections.get_mut(&token) {
            Some(conn) => {
                if let Some(mut process) = conn.cgi.take() {
                    process.deregister(self.poll.registry());
                }
                conn.server_idx
            }
            None => return,
        };
        self.pipes.retain(|_, (owner, _)| *owner != token);

        let response = result.unwrap_or_else(|e| {
            log::warn!("CGI failed for {:?}: {}", token, e);
            Response::error(self.config.servers.get(server_idx), 500)
        });
        self.finalize_response(token, response);
    }

    /// Reap finished children and kill those past their deadline.
    fn check_cgi(&mut self) {
        let now = Instant::now();
        let pending: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.cgi.is_some())
            .map(|(&t, _)| t)
            .collect();

        for token in pending {
            let outcome = match self.connections.get_mut(&token).and_then(|c| c.cgi.as_mut()) {
                Some(process) => match process.try_finish() {
                    Some(result) => Some(result),
                    None if process.expired(now) => {
                        let err = process.timeout_error();
                        process.kill();
                        Some(Err(err))
                    }
                    None => None,
                },
                None => None,
            };
            if let Some(result) = outcome {
                self.complete_cgi(token, result);
            }
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let timeout = self.config.timeout;
        let expired: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| {
                let limit = match conn.state {
                    ConnectionState::Linger => timeout.min(LINGER_TIMEOUT),
                    _ => timeout,
                };
                now.duration_since(conn.last_activity) > limit
            })
            .map(|(&t, _)| t)
            .collect();

        for token in expired {
            if let Some(conn) = self.connections.get(&token) {
                log::warn!("closing idle connection from {}", conn.peer);
            }
            self.close_connection(token);
        }
    }

    fn finalize_response(&mut self, token: Token, response: Response) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };
        log::info!(
            "{} \"{}\" {} {}",
            conn.peer,
            conn.request_line,
            response.status,
            response.body.len()
        );
        conn.write_buffer = response.serialize(conn.keep_alive);
        conn.bytes_written = 0;
        conn.state = ConnectionState::WriteResponse;
        conn.last_activity = Instant::now();

        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::WRITABLE)
        {
            log::warn!("failed to reregister {:?}: {}", token, e);
            self.close_connection(token);
            return;
        }
        self.write_to_client(token);
    }

    fn write_to_client(&mut self, token: Token) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) if c.state == ConnectionState::WriteResponse => c,
            _ => return,
        };

        while conn.bytes_written < conn.write_buffer.len() {
            match conn.stream.write(&conn.write_buffer[conn.bytes_written..]) {
                Ok(0) => {
                    self.close_connection(token);
                    return;
                }
                Ok(n) => {
                    conn.bytes_written += n;
                    conn.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("write to {} failed: {}", conn.peer, e);
                    self.close_connection(token);
                    return;
                }
            }
        }

        if !conn.keep_alive {
            self.linger(token);
            return;
        }
        conn.reset_for_next_request();
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::READABLE)
        {
            log::warn!("failed to reregister {:?}: {}", token, e);
            self.close_connection(token);
            return;
        }
        self.resume.push_back(token);
    }

    /// Shut down the write side and keep reading, so unread request bytes
    /// do not turn the close into a reset that destroys the response.
    fn linger(&mut self, token: Token) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };
        if conn.stream.shutdown(Shutdown::Write).is_err() {
            self.close_connection(token);
            return;
        }
        conn.state = ConnectionState::Linger;
        conn.read_buffer.clear();
        conn.discarded = 0;
        conn.last_activity = Instant::now();
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, Interest::READABLE)
        {
            log::warn!("failed to reregister {:?}: {}", token, e);
            self.close_connection(token);
            return;
        }
        self.drain(token);
    }

    fn drain(&mut self, token: Token) {
        let mut buf = [0u8; READ_CHUNK];
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    conn.discarded += n;
                    if conn.discarded > LINGER_LIMIT {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.close_connection(token);
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            if let Some(mut process) = conn.cgi.take() {
                log::debug!("killing CGI pid {} for {}", process.pid(), conn.peer);
                process.deregister(self.poll.registry());
            }
            self.pipes.retain(|_, (owner, _)| *owner != token);
            let _ = self.poll.registry().deregister(&mut conn.stream);
            log::debug!("closed {} ({:?})", conn.peer, token);
        }
    }
}
