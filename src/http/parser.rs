//! Incremental HTTP/1.x request parser.
//!
//! The parser is a small state machine driven by whatever bytes the socket
//! produced so far. Each state owns one transition function that inspects
//! the unconsumed input and either asks for more bytes or consumes a prefix
//! and moves on. Bytes past the end of a request stay in the caller's buffer
//! so pipelined requests survive [`RequestParser::reset`].

use crate::error::ParseError;
use crate::http::request::{Headers, HttpRequest, Method, Version};
use crate::http::uri::{split_target, url_decode};

const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    StartLine,
    Headers,
    Body(BodyState),
    Complete,
    Error(ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    Length { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkEnd,
    Trailers,
}

enum Step {
    NeedMore,
    Consumed(usize),
    Done(usize),
}

/// Body size limit chosen once the request head is known.
pub type BodyLimit<'a> = &'a dyn Fn(&HttpRequest) -> usize;

#[derive(Debug)]
pub struct RequestParser {
    state: State,
    request: Option<HttpRequest>,
    max_header_size: usize,
    head_bytes: usize,
    body_limit: usize,
}

impl RequestParser {
    pub fn new(max_header_size: usize) -> Self {
        Self {
            state: State::StartLine,
            request: None,
            max_header_size,
            head_bytes: 0,
            body_limit: usize::MAX,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Whether some bytes of a request have been consumed but the request
    /// is not finished yet.
    pub fn in_progress(&self) -> bool {
        match self.state {
            State::StartLine => self.head_bytes > 0,
            State::Headers | State::Body(_) => true,
            State::Complete | State::Error(_) => false,
        }
    }

    /// Prepare for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = State::StartLine;
        self.request = None;
        self.head_bytes = 0;
        self.body_limit = usize::MAX;
    }

    /// Consume as much of `buf` as possible. Returns the request once it is
    /// complete; after that the parser stays in `Complete` until
    /// [`reset`](Self::reset) is called.
    pub fn parse(
        &mut self,
        buf: &mut Vec<u8>,
        body_limit: BodyLimit<'_>,
    ) -> Result<Option<HttpRequest>, ParseError> {
        let mut offset = 0;
        let result = loop {
            let input = &buf[offset..];
            let step = match self.state {
                State::StartLine => self.on_start_line(input),
                State::Headers => self.on_header_line(input, body_limit),
                State::Body(body) => self.on_body(body, input),
                State::Complete => break Ok(None),
                State::Error(ref e) => break Err(e.clone()),
            };
            match step {
                Ok(Step::NeedMore) => break Ok(None),
                Ok(Step::Consumed(n)) => offset += n,
                Ok(Step::Done(n)) => {
                    offset += n;
                    self.state = State::Complete;
                    break Ok(self.request.take());
                }
                Err(e) => {
                    self.state = State::Error(e.clone());
                    break Err(e);
                }
            }
        };
        buf.drain(..offset);
        result
    }

    fn on_start_line(&mut self, input: &[u8]) -> Result<Step, ParseError> {
        // Tolerate stray line breaks between pipelined requests.
        if input.starts_with(b"\r\n") {
            return Ok(Step::Consumed(2));
        }
        if input.starts_with(b"\n") {
            return Ok(Step::Consumed(1));
        }

        let (line, consumed) = match next_line(input) {
            Some(found) => found,
            None => return self.need_more_head(input.len()),
        };
        self.count_head(consumed)?;

        let line = std::str::from_utf8(line)
            .map_err(|_| ParseError::BadRequest("request line is not valid UTF-8"))?;
        let mut parts = line.split(' ');
        let fields = (parts.next(), parts.next(), parts.next(), parts.next());
        let (method, target, version) = match fields {
            (Some(m), Some(t), Some(v), None) => (m, t, v),
            _ => return Err(ParseError::BadRequest("malformed request line")),
        };

        if method.is_empty() || !method.bytes().all(is_token_byte) {
            return Err(ParseError::BadRequest("invalid method"));
        }
        let version = parse_version(version)?;
        let target = origin_form(target)?;

        let (raw_path, query) = split_target(target);
        let path = String::from_utf8(url_decode(raw_path))
            .map_err(|_| ParseError::BadRequest("path is not valid UTF-8"))?;

        self.request = Some(HttpRequest {
            method: Method::from_token(method),
            target: target.to_string(),
            path,
            query: query.to_string(),
            version,
            headers: Headers::new(),
            body: Vec::new(),
        });
        self.state = State::Headers;
        Ok(Step::Consumed(consumed))
    }

    fn on_header_line(
        &mut self,
        input: &[u8],
        body_limit: BodyLimit<'_>,
    ) -> Result<Step, ParseError> {
        let (line, consumed) = match next_line(input) {
            Some(found) => found,
            None => return self.need_more_head(input.len()),
        };
        self.count_head(consumed)?;

        if line.is_empty() {
            return self.finish_head(consumed, body_limit);
        }
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(ParseError::BadRequest("folded header line"));
        }

        let line = std::str::from_utf8(line)
            .map_err(|_| ParseError::BadRequest("header is not valid UTF-8"))?;
        let (name, value) = line
            .split_once(':')
            .ok_or(ParseError::BadRequest("header without colon"))?;
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(ParseError::BadRequest("invalid header name"));
        }
        let value = value.trim_matches(|c| c == ' ' || c == '\t');

        let request = self
            .request
            .as_mut()
            .ok_or(ParseError::BadRequest("header before request line"))?;
        if name.eq_ignore_ascii_case("content-length") {
            if let Some(previous) = request.headers.get("content-length") {
                if previous != value {
                    return Err(ParseError::BadRequest("conflicting Content-Length"));
                }
            }
        }
        request.headers.insert(name, value);
        Ok(Step::Consumed(consumed))
    }

    fn finish_head(
        &mut self,
        consumed: usize,
        body_limit: BodyLimit<'_>,
    ) -> Result<Step, ParseError> {
        let request = self
            .request
            .as_ref()
            .ok_or(ParseError::BadRequest("missing request line"))?;

        if request.version == Version::Http11 && !request.headers.contains("host") {
            return Err(ParseError::BadRequest("missing Host header"));
        }

        let chunked = match request.headers.get("transfer-encoding") {
            Some(te) if te.eq_ignore_ascii_case("chunked") => true,
            Some(te) => return Err(ParseError::UnsupportedEncoding(te.to_string())),
            None => false,
        };
        let content_length = match request.headers.get("content-length") {
            Some(_) if chunked => {
                return Err(ParseError::BadRequest("both Content-Length and Transfer-Encoding"));
            }
            Some(v) => Some(
                v.parse::<usize>()
                    .map_err(|_| ParseError::BadRequest("invalid Content-Length"))?,
            ),
            None => None,
        };

        self.body_limit = body_limit(request);

        match content_length {
            Some(len) if len > self.body_limit => Err(ParseError::PayloadTooLarge {
                limit: self.body_limit,
            }),
            Some(len) if len > 0 => {
                if let Some(request) = self.request.as_mut() {
                    request.body.reserve(len.min(64 * 1024));
                }
                self.state = State::Body(BodyState::Length { remaining: len });
                Ok(Step::Consumed(consumed))
            }
            _ if chunked => {
                self.state = State::Body(BodyState::ChunkSize);
                Ok(Step::Consumed(consumed))
            }
            _ => Ok(Step::Done(consumed)),
        }
    }

    fn on_body(&mut self, body: BodyState, input: &[u8]) -> Result<Step, ParseError> {
        match body {
            BodyState::Length { remaining } => {
                if input.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let n = remaining.min(input.len());
                self.append_body(&input[..n]);
                if n == remaining {
                    Ok(Step::Done(n))
                } else {
                    self.state = State::Body(BodyState::Length {
                        remaining: remaining - n,
                    });
                    Ok(Step::Consumed(n))
                }
            }
            BodyState::ChunkSize => {
                let (line, consumed) = match next_line(input) {
                    Some(found) => found,
                    None if input.len() > MAX_CHUNK_LINE => {
                        return Err(ParseError::BadRequest("chunk size line too long"));
                    }
                    None => return Ok(Step::NeedMore),
                };
                let size = parse_chunk_size(line)?;
                if size == 0 {
                    self.state = State::Body(BodyState::Trailers);
                    return Ok(Step::Consumed(consumed));
                }
                let received = self.request.as_ref().map_or(0, |r| r.body.len());
                if received.saturating_add(size) > self.body_limit {
                    return Err(ParseError::PayloadTooLarge {
                        limit: self.body_limit,
                    });
                }
                self.state = State::Body(BodyState::ChunkData { remaining: size });
                Ok(Step::Consumed(consumed))
            }
            BodyState::ChunkData { remaining } => {
                if input.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let n = remaining.min(input.len());
                self.append_body(&input[..n]);
                self.state = State::Body(if n == remaining {
                    BodyState::ChunkEnd
                } else {
                    BodyState::ChunkData {
                        remaining: remaining - n,
                    }
                });
                Ok(Step::Consumed(n))
            }
            BodyState::ChunkEnd => {
                if input.starts_with(b"\r\n") {
                    self.state = State::Body(BodyState::ChunkSize);
                    Ok(Step::Consumed(2))
                } else if input.starts_with(b"\n") {
                    self.state = State::Body(BodyState::ChunkSize);
                    Ok(Step::Consumed(1))
                } else if input.is_empty() || input == b"\r" {
                    Ok(Step::NeedMore)
                } else {
                    Err(ParseError::BadRequest("missing CRLF after chunk"))
                }
            }
            BodyState::Trailers => match next_line(input) {
                Some((line, consumed)) if line.is_empty() => Ok(Step::Done(consumed)),
                Some((_, consumed)) => Ok(Step::Consumed(consumed)),
                None if input.len() > self.max_header_size => Err(ParseError::HeadersTooLarge {
                    limit: self.max_header_size,
                }),
                None => Ok(Step::NeedMore),
            },
        }
    }

    fn append_body(&mut self, data: &[u8]) {
        if let Some(request) = self.request.as_mut() {
            request.body.extend_from_slice(data);
        }
    }

    fn count_head(&mut self, consumed: usize) -> Result<(), ParseError> {
        self.head_bytes += consumed;
        if self.head_bytes > self.max_header_size {
            return Err(ParseError::HeadersTooLarge {
                limit: self.max_header_size,
            });
        }
        Ok(())
    }

    fn need_more_head(&self, pending: usize) -> Result<Step, ParseError> {
        if self.head_bytes + pending > self.max_header_size {
            return Err(ParseError::HeadersTooLarge {
                limit: self.max_header_size,
            });
        }
        Ok(Step::NeedMore)
    }
}

/// Returns the next line without its terminator, and the number of bytes
/// including the terminator.
fn next_line(input: &[u8]) -> Option<(&[u8], usize)> {
    let pos = input.iter().position(|&b| b == b'\n')?;
    let line = &input[..pos];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, pos + 1))
}

fn parse_version(version: &str) -> Result<Version, ParseError> {
    match version {
        "HTTP/1.1" => Ok(Version::Http11),
        "HTTP/1.0" => Ok(Version::Http10),
        v if v.starts_with("HTTP/") => Err(ParseError::UnsupportedVersion(v.to_string())),
        _ => Err(ParseError::BadRequest("invalid protocol version")),
    }
}

/// Reduce an absolute-form target to origin form.
fn origin_form(target: &str) -> Result<&str, ParseError> {
    if target.starts_with('/') {
        return Ok(target);
    }
    let lower = target.get(..8).map(|s| s.to_ascii_lowercase()).unwrap_or_default();
    let rest = if lower.starts_with("http://") {
        &target[7..]
    } else if lower.starts_with("https://") {
        &target[8..]
    } else {
        return Err(ParseError::BadRequest("invalid request target"));
    };
    Ok(rest.find('/').map_or("/", |pos| &rest[pos..]))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ParseError::BadRequest("invalid chunk size"))?;
    let digits = line.split(';').next().unwrap_or("").trim();
    if digits.is_empty() {
        return Err(ParseError::BadRequest("invalid chunk size"));
    }
    usize::from_str_radix(digits, 16).map_err(|_| ParseError::BadRequest("invalid chunk size"))
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
