use crate::error::CgiError;
use crate::handlers::cgi;
use crate::http::response::Response;
use crate::router::CgiTarget;
use mio::unix::pipe::{Receiver, Sender};
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::process::Child;
use std::time::{Duration, Instant};

/// Upper bound on the buffered stdout of one script.
pub const MAX_OUTPUT: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Stdin,
    Stdout,
}

/// A running CGI child whose stdin and stdout sit in the poll set.
/// Dropping it kills the whole process group.
pub struct CgiProcess {
    child: Child,
    stdin: Option<Sender>,
    stdout: Option<Receiver>,
    input: Vec<u8>,
    input_written: usize,
    output: Vec<u8>,
    output_done: bool,
    overflowed: bool,
    deadline: Instant,
    timeout: Duration,
    reaped: bool,
}

impl CgiProcess {
    pub fn start(
        target: &CgiTarget,
        env: Vec<(String, String)>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Self, CgiError> {
        let mut child = cgi::spawn(target, env)?;
        let pipes = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => {
                let sender = Sender::from(stdin);
                let receiver = Receiver::from(stdout);
                sender
                    .set_nonblocking(true)
                    .and_then(|_| receiver.set_nonblocking(true))
                    .map(|_| (sender, receiver))
            }
            _ => Err(io::Error::other("child pipes missing")),
        };

        let mut process = Self {
            child,
            stdin: None,
            stdout: None,
            input: body,
            input_written: 0,
            output: Vec::new(),
            output_done: false,
            overflowed: false,
            deadline: Instant::now() + timeout,
            timeout,
            reaped: false,
        };
        // on error the drop below kills the child
        let (sender, receiver) = pipes.map_err(CgiError::Pipe)?;
        if !process.input.is_empty() {
            process.stdin = Some(sender);
        }
        process.stdout = Some(receiver);
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn register(
        &mut self,
        registry: &Registry,
        stdin_token: Token,
        stdout_token: Token,
    ) -> io::Result<()> {
        if let Some(stdin) = self.stdin.as_mut() {
            registry.register(stdin, stdin_token, Interest::WRITABLE)?;
        }
        if let Some(stdout) = self.stdout.as_mut() {
            registry.register(stdout, stdout_token, Interest::READABLE)?;
        }
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) {
        self.close_stdin(registry);
        if let Some(mut stdout) = self.stdout.take() {
            let _ = registry.deregister(&mut stdout);
        }
    }

    /// Feed the request body until the pipe would block. The pipe is closed
    /// once everything is written or the script stops reading.
    pub fn write_input(&mut self, registry: &Registry) -> io::Result<()> {
        let stdin = match self.stdin.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };
        while self.input_written < self.input.len() {
            match stdin.write(&self.input[self.input_written..]) {
                Ok(0) => break,
                Ok(n) => self.input_written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
                Err(e) => {
                    self.close_stdin(registry);
                    return Err(e);
                }
            }
        }
        self.close_stdin(registry);
        Ok(())
    }

    /// Drain stdout until it would block or reaches end of file. Output past
    /// `MAX_OUTPUT` kills the script.
    pub fn read_output(&mut self, registry: &Registry) -> io::Result<()> {
        let stdout = match self.stdout.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };
        let mut buf = [0u8; 8192];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => {
                    if let Some(mut stdout) = self.stdout.take() {
                        let _ = registry.deregister(&mut stdout);
                    }
                    self.output_done = true;
                    return Ok(());
                }
                Ok(n) if self.output.len() + n > MAX_OUTPUT => {
                    if let Some(mut stdout) = self.stdout.take() {
                        let _ = registry.deregister(&mut stdout);
                    }
                    self.output_done = true;
                    self.overflowed = true;
                    self.kill();
                    return Ok(());
                }
                Ok(n) => self.output.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// The final response once stdout is closed and the child has exited,
    /// `None` while either is still pending.
    pub fn try_finish(&mut self) -> Option<Result<Response, CgiError>> {
        if !self.output_done {
            return None;
        }
        if self.overflowed {
            return Some(Err(CgiError::OutputTooLarge(MAX_OUTPUT)));
        }
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                self.kill();
                return Some(Err(CgiError::Pipe(e)));
            }
        };
        self.reaped = true;
        if !status.success() {
            return Some(Err(CgiError::ExitStatus(status)));
        }
        Some(cgi::parse_output(&self.output))
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn timeout_error(&self) -> CgiError {
        CgiError::Timeout(self.timeout.as_secs())
    }

    /// SIGKILL the process group and reap the child.
    pub fn kill(&mut self) {
        if self.reaped {
            return;
        }
        let pid = self.child.id() as libc::pid_t;
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }

    fn close_stdin(&mut self, registry: &Registry) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = registry.deregister(&mut stdin);
        }
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        self.kill();
    }
}
