use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

const BIN: &str = env!("CARGO_BIN_EXE_webserv");

fn get_unused_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("failed to get unused port")
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

fn run_with_config(config: &str) -> Output {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.conf");
    fs::write(&path, config).unwrap();
    Command::new(BIN).arg(&path).output().unwrap()
}

#[derive(Debug)]
struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read exactly one response framed by its Content-Length.
fn read_response(stream: &mut TcpStream) -> Response {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("failed to read response head");
        assert!(n > 0, "connection closed before response head: {:?}", raw);
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers: HashMap<String, String> = lines
        .filter(|l| !l.is_empty())
        .map(|l| {
            let (name, value) = l.split_once(": ").unwrap();
            (name.to_ascii_lowercase(), value.to_string())
        })
        .collect();
    let length: usize = headers["content-length"].parse().unwrap();
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    Response {
        status,
        headers,
        body,
    }
}

/// A running server over a temporary document root.
struct Server {
    child: Child,
    port: u16,
    root: TempDir,
}

impl Server {
    /// `extra` is appended inside the server block, `globals` before it.
    fn start(globals: &str, extra: &str) -> Self {
        let root = tempdir().unwrap();
        fs::write(root.path().join("index.html"), "<h1>hello</h1>").unwrap();
        fs::create_dir(root.path().join("upload")).unwrap();
        fs::create_dir(root.path().join("cgi-bin")).unwrap();
        Self::start_in(root, globals, extra)
    }

    fn start_in(root: TempDir, globals: &str, extra: &str) -> Self {
        let port = get_unused_port();
        let config = format!(
            "{globals}
server {{
    server_name localhost;
    host 127.0.0.1;
    listen {port};
    root {root};
    client_max_body_size 16;
    location / {{ allow_methods GET; }}
    location /upload {{
        allow_methods GET POST DELETE;
        upload_dir {root}/upload;
    }}
    location /cgi-bin {{
        allow_methods GET POST;
        cgi .sh /bin/sh;
    }}
    {extra}
}}
",
            root = root.path().display(),
        );
        let config_path = root.path().join("test.conf");
        fs::write(&config_path, config).unwrap();

        let child = Command::new(BIN)
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv");
        // created early so the child is killed if startup fails
        let server = Self { child, port, root };
        assert!(wait_for_port(port), "webserv did not start listening");
        server
    }

    fn path(&self, relative: &str) -> std::path::PathBuf {
        self.root.path().join(relative)
    }

    fn stream(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect");
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.set_write_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    fn request(&self, raw: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(raw).unwrap();
        read_response(&mut stream)
    }

    fn get(&self, path: &str) -> Response {
        self.request(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
    }

    fn send(&self, method: &str, path: &str, body: &[u8]) -> Response {
        let mut raw = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            method,
            path,
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        self.request(&raw)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
}

#[test]
fn missing_argument_prints_usage() {
    let output = Command::new(BIN).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error: Usage: "), "stderr: {}", stderr);
    assert!(stderr.contains("<config_file>.conf"));
}

#[test]
fn empty_config_is_rejected() {
    let output = run_with_config("   \n# only a comment\n");
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error: empty config"));
}

#[test]
fn unknown_directive_is_rejected() {
    let output = run_with_config(
        "server { host 127.0.0.1; listen 1; root /tmp; server_name a; bogus on; }",
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("bogus"));
}

#[test]
fn occupied_port_is_fatal() {
    let taken = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = taken.local_addr().unwrap().port();
    let output = run_with_config(&format!(
        "server {{ host 127.0.0.1; listen {}; root /tmp; server_name a; }}",
        port
    ));
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to bind"), "stderr: {}", stderr);
}

#[test]
fn serves_index_and_404() {
    let server = Server::start("", "");
    let response = server.get("/");
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "<h1>hello</h1>");
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    assert!(response.header("Date").is_some());

    let missing = server.get("/nope.html");
    assert_eq!(missing.status, 404);
    let length = missing.header("content-length").map(|l| l.parse::<usize>().unwrap());
    assert_eq!(length, Some(missing.body.len()));
}

#[test]
fn custom_error_page() {
    let root = tempdir().unwrap();
    fs::write(root.path().join("missing.html"), "custom not found").unwrap();
    for dir in ["upload", "cgi-bin"] {
        fs::create_dir(root.path().join(dir)).unwrap();
    }
    let server = Server::start_in(root, "", "error_page 404 /missing.html;");
    let response = server.get("/nothing");
    assert_eq!(response.status, 404);
    assert_eq!(response.text(), "custom not found");
}

#[test]
fn traversal_is_refused() {
    let server = Server::start("", "");
    let response = server.get("/../../etc/passwd");
    assert_eq!(response.status, 403);
}

#[test]
fn upload_round_trip() {
    let server = Server::start("", "");
    let response = server.send("POST", "/upload/note.txt", b"sixteen bytes!!!");
    assert_eq!(response.status, 200);
    assert_eq!(fs::read(server.path("upload/note.txt")).unwrap(), b"sixteen bytes!!!");

    let fetched = server.get("/upload/note.txt");
    assert_eq!(fetched.status, 200);
    assert_eq!(fetched.body, b"sixteen bytes!!!");
}

#[test]
fn body_over_limit_is_413() {
    let server = Server::start("", "");
    // headers only: the limit is enforced from the declared length
    let response = server.request(
        b"POST /upload/big.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 17\r\n\r\n",
    );
    assert_eq!(response.status, 413);
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(!server.path("upload/big.txt").exists());
}

#[test]
fn empty_upload_creates_empty_file() {
    let server = Server::start("", "");
    let response = server.send("POST", "/upload/empty.txt", b"");
    assert_eq!(response.status, 200);
    assert_eq!(fs::read(server.path("upload/empty.txt")).unwrap(), b"");
}

#[test]
fn body_over_limit_is_413_after_full_send() {
    let server = Server::start("", "");
    let body = vec![b'x'; 100_000];
    let mut stream = server.stream();
    stream
        .write_all(
            format!(
                "POST /upload/big.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        )
        .unwrap();
    stream.write_all(&body).unwrap();

    let response = read_response(&mut stream);
    assert_eq!(response.status, 413);
    // the connection ends with a clean close rather than a reset
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
    assert!(!server.path("upload/big.txt").exists());
}

#[test]
fn post_outside_upload_location() {
    let server = Server::start("", "location /forms { allow_methods POST; }");
    assert_eq!(server.send("POST", "/forms/x", b"data").status, 403);
    assert_eq!(server.send("POST", "/index.html", b"data").status, 405);
}

#[test]
fn delete_twice() {
    let server = Server::start("", "");
    fs::write(server.path("upload/gone.txt"), "bye").unwrap();
    assert_eq!(server.send("DELETE", "/upload/gone.txt", b"").status, 200);
    assert!(!server.path("upload/gone.txt").exists());
    assert_eq!(server.send("DELETE", "/upload/gone.txt", b"").status, 404);
}

#[test]
fn put_and_head_are_405() {
    let server = Server::start("", "");
    let put = server.send("PUT", "/upload/x", b"data");
    assert_eq!(put.status, 405);
    assert_eq!(put.header("Allow"), Some("GET, POST, DELETE"));
    let head = server.request(b"HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(head.status, 405);
    assert_eq!(head.header("Allow"), Some("GET"));
}

#[test]
fn redirect_location() {
    let server = Server::start("", "location /old { redirect /upload/; }");
    let response = server.get("/old/page");
    assert_eq!(response.status, 301);
    assert_eq!(response.header("Location"), Some("/upload/"));
}

#[test]
fn malformed_request_is_400() {
    let server = Server::start("", "");
    let response = server.request(b"GARBAGE\r\n\r\n");
    assert_eq!(response.status, 400);
    let response = server.request(b"GET / HTTP/2.0\r\nHost: localhost\r\n\r\n");
    assert_eq!(response.status, 505);
}

#[test]
fn pipelined_requests_answer_in_order() {
    let server = Server::start("", "");
    fs::write(server.path("a.txt"), "first").unwrap();
    fs::write(server.path("b.txt"), "second").unwrap();

    let mut stream = server.stream();
    stream
        .write_all(
            b"GET /a.txt HTTP/1.1\r\nHost: localhost\r\n\r\n\
              GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n\
              GET /b.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .unwrap();

    let first = read_response(&mut stream);
    assert_eq!((first.status, first.text().as_str()), (200, "first"));
    assert_eq!(first.header("Connection"), Some("keep-alive"));
    assert_eq!(read_response(&mut stream).status, 404);
    let third = read_response(&mut stream);
    assert_eq!((third.status, third.text().as_str()), (200, "second"));
    assert_eq!(third.header("Connection"), Some("close"));

    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn keep_alive_can_be_disabled() {
    let server = Server::start("keep_alive off;", "");
    let mut stream = server.stream();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.header("Connection"), Some("close"));
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn connection_cap_sends_503() {
    let server = Server::start("max_clients 2;", "");
    // the startup port check connection has to be gone first
    sleep(Duration::from_millis(300));
    let _first = server.stream();
    let _second = server.stream();
    // let the reactor accept both before the third arrives
    sleep(Duration::from_millis(300));

    let mut third = server.stream();
    let response = read_response(&mut third);
    assert_eq!(response.status, 503);
    assert_eq!(response.header("Connection"), Some("close"));
}

#[test]
fn cgi_script_runs() {
    let server = Server::start("", "");
    write_script(
        &server.path("cgi-bin/hello.sh"),
        "printf 'Content-Type: text/plain\\r\\nX-Script: yes\\r\\n\\r\\n'\n\
         printf '%s|%s|%s\\n' \"$REQUEST_METHOD\" \"$QUERY_STRING\" \"$PATH_INFO\"\n\
         cat\n",
    );

    let response = server.get("/cgi-bin/hello.sh/extra?name=web");
    assert_eq!(response.status, 200);
    assert_eq!(response.header("X-Script"), Some("yes"));
    assert_eq!(response.text(), "GET|name=web|/extra\n");

    let posted = server.send("POST", "/cgi-bin/hello.sh", b"a=1");
    assert_eq!(posted.status, 200);
    assert_eq!(posted.text(), "POST||/cgi-bin/hello.sh\na=1");
}

#[test]
fn cgi_failure_is_500() {
    let server = Server::start("", "");
    write_script(&server.path("cgi-bin/broken.sh"), "echo 'no header block'\nexit 1\n");
    assert_eq!(server.get("/cgi-bin/broken.sh").status, 500);
    assert_eq!(server.get("/cgi-bin/absent.sh").status, 404);
}

#[test]
fn cgi_deadline_is_enforced() {
    let server = Server::start("cgi_timeout 1;", "");
    write_script(&server.path("cgi-bin/slow.sh"), "sleep 30\n");

    let started = Instant::now();
    let response = server.get("/cgi-bin/slow.sh");
    assert_eq!(response.status, 500);
    assert!(started.elapsed() < Duration::from_secs(5));

    // the server keeps answering afterwards
    assert_eq!(server.get("/").status, 200);
}

#[test]
fn idle_connection_is_closed() {
    let server = Server::start("timeout 1;", "");
    let mut stream = server.stream();
    stream.write_all(b"GET / HTTP/1.1\r\n").unwrap();
    let started = Instant::now();
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionReset),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}
