//! CGI/1.1 glue: environment construction, process launch and parsing of
//! the script's output into a [`Response`]. The non-blocking pipe handling
//! lives in `server::cgi`.

use crate::config::ServerConfig;
use crate::error::CgiError;
use crate::http::request::HttpRequest;
use crate::http::response::{Response, SERVER_SOFTWARE};
use crate::router::CgiTarget;
use std::net::SocketAddr;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

pub fn build_env(
    target: &CgiTarget,
    request: &HttpRequest,
    server: &ServerConfig,
    remote: SocketAddr,
) -> Vec<(String, String)> {
    let server_name = request
        .host()
        .map(str::to_string)
        .unwrap_or_else(|| match server.primary_name() {
            "" => server.host.clone(),
            name => name.to_string(),
        });
    let path_info = if target.path_info.is_empty() {
        request.path.clone()
    } else {
        target.path_info.clone()
    };

    let mut env = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_PROTOCOL".to_string(), request.version.as_str().to_string()),
        ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
        ("SERVER_NAME".to_string(), server_name),
        ("SERVER_PORT".to_string(), server.port.to_string()),
        ("REQUEST_METHOD".to_string(), request.method.to_string()),
        ("SCRIPT_NAME".to_string(), target.script_name.clone()),
        (
            "SCRIPT_FILENAME".to_string(),
            script_path(target).to_string_lossy().into_owned(),
        ),
        ("PATH_INFO".to_string(), path_info),
        ("QUERY_STRING".to_string(), request.query.clone()),
        ("REMOTE_ADDR".to_string(), remote.ip().to_string()),
        ("REMOTE_PORT".to_string(), remote.port().to_string()),
        ("REDIRECT_STATUS".to_string(), "200".to_string()),
    ];
    if !request.body.is_empty() {
        env.push(("CONTENT_LENGTH".to_string(), request.body.len().to_string()));
    }
    if let Some(ct) = request.content_type() {
        env.push(("CONTENT_TYPE".to_string(), ct.to_string()));
    }
    if let Ok(path) = std::env::var("PATH") {
        env.push(("PATH".to_string(), path));
    }
    for (name, value) in request.headers.iter() {
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        env.push((key, value.to_string()));
    }
    env
}

/// Launch the script in its own process group with piped stdin/stdout,
/// running from the script's directory.
pub fn spawn(target: &CgiTarget, env: Vec<(String, String)>) -> Result<Child, CgiError> {
    let script = script_path(target);
    let (program, mut command) = match &target.interpreter {
        Some(interpreter) => {
            let mut cmd = Command::new(interpreter);
            cmd.arg(&script);
            (interpreter.clone(), cmd)
        }
        None => (script.clone(), Command::new(&script)),
    };
    if let Some(dir) = script.parent() {
        command.current_dir(dir);
    }

    command
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .process_group(0)
        .spawn()
        .map_err(|source| CgiError::Spawn {
            program: program.display().to_string(),
            source,
        })
}

fn script_path(target: &CgiTarget) -> PathBuf {
    target
        .script
        .canonicalize()
        .unwrap_or_else(|_| target.script.clone())
}

/// Turn raw script output into a response. The header block ends at the
/// first blank line; `Status` sets the status line and a `Location`
/// without one yields a 302.
pub fn parse_output(output: &[u8]) -> Result<Response, CgiError> {
    if output.is_empty() {
        return Err(CgiError::MalformedOutput("empty output"));
    }

    let crlf = find(output, b"\r\n\r\n");
    let lf = find(output, b"\n\n");
    let (head, body) = match (crlf, lf) {
        (Some(c), Some(l)) if l < c => (&output[..l], &output[l + 2..]),
        (Some(c), _) => (&output[..c], &output[c + 4..]),
        (None, Some(l)) => (&output[..l], &output[l + 2..]),
        (None, None) => return Err(CgiError::MalformedOutput("missing header terminator")),
    };
    let head = std::str::from_utf8(head)
        .map_err(|_| CgiError::MalformedOutput("header block is not UTF-8"))?;

    let mut response = Response::new(200);
    let mut status_set = false;
    for line in head.lines().filter(|l| !l.trim().is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or(CgiError::MalformedOutput("header line without a colon"))?;
        let (name, value) = (name.trim(), value.trim());

        if name.eq_ignore_ascii_case("status") {
            let (code, reason) = value.split_once(' ').unwrap_or((value, ""));
            let code: u16 = code
                .parse()
                .ok()
                .filter(|c| (100..1000).contains(c))
                .ok_or(CgiError::MalformedOutput("invalid Status header"))?;
            response.status = code;
            if !reason.trim().is_empty() {
                response.reason = Some(reason.trim().to_string());
            }
            status_set = true;
        } else {
            response.add_header(name, value);
        }
    }

    if !status_set && response.header("Location").is_some() {
        response.status = 302;
    }
    if response.header("Content-Type").is_none() {
        response.set_header("Content-Type", "text/plain");
    }
    response.body = body.to_vec();
    Ok(response)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
