use crate::config::models::{
    Config, DEFAULT_INDEX, DEFAULT_MAX_BODY_SIZE, Location, ServerConfig,
};
use crate::error::ConfigError;
use crate::http::request::Method;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, PartialEq)]
enum TokenKind {
    Word(String),
    Open,
    Close,
    End,
}

#[derive(Debug)]
struct Token {
    kind: TokenKind,
    line: usize,
}

/// One `key args...;` statement, or `key args... { ... }` when it opens a
/// block.
#[derive(Debug)]
struct Statement {
    directive: String,
    args: Vec<String>,
    line: usize,
    block: Option<Vec<Statement>>,
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    parse_str(&content)
}

pub fn parse_str(content: &str) -> Result<Config, ConfigError> {
    let tokens = tokenize(content);
    if tokens.is_empty() {
        return Err(ConfigError::Empty);
    }

    let mut iter = tokens.into_iter().peekable();
    let statements = parse_statements(&mut iter, None)?;

    let mut config = Config::default();
    for stmt in statements {
        match stmt.directive.as_str() {
            "server" => {
                let block = expect_block(&stmt, 0)?;
                let server = build_server(config.servers.len() + 1, block)?;
                config.servers.push(server);
            }
            "max_clients" => {
                config.max_clients = parse_number(&stmt)?;
                if config.max_clients == 0 {
                    return Err(invalid(&stmt));
                }
            }
            "timeout" => config.timeout = Duration::from_secs(parse_number(&stmt)?),
            "cgi_timeout" => config.cgi_timeout = Duration::from_secs(parse_number(&stmt)?),
            "keep_alive" => config.keep_alive = parse_switch(&stmt)?,
            "max_header_size" => config.max_header_size = parse_size(&stmt)?,
            _ => return Err(unknown(&stmt)),
        }
    }

    if config.servers.is_empty() {
        return Err(ConfigError::NoServers);
    }
    check_virtual_hosts(&config.servers)?;
    Ok(config)
}

fn tokenize(content: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (idx, raw_line) in content.lines().enumerate() {
        let line = idx + 1;
        let code = raw_line.split('#').next().unwrap_or("");
        let mut word = String::new();
        for c in code.chars() {
            let kind = match c {
                '{' => Some(TokenKind::Open),
                '}' => Some(TokenKind::Close),
                ';' => Some(TokenKind::End),
                c if c.is_whitespace() => None,
                c => {
                    word.push(c);
                    continue;
                }
            };
            if !word.is_empty() {
                tokens.push(Token {
                    kind: TokenKind::Word(std::mem::take(&mut word)),
                    line,
                });
            }
            if let Some(kind) = kind {
                tokens.push(Token { kind, line });
            }
        }
        if !word.is_empty() {
            tokens.push(Token {
                kind: TokenKind::Word(word),
                line,
            });
        }
    }
    tokens
}

fn parse_statements<I>(
    tokens: &mut std::iter::Peekable<I>,
    opened_at: Option<usize>,
) -> Result<Vec<Statement>, ConfigError>
where
    I: Iterator<Item = Token>,
{
    let mut statements = Vec::new();
    loop {
        let token = match tokens.next() {
            Some(t) => t,
            None => {
                return match opened_at {
                    Some(line) => Err(ConfigError::Syntax {
                        line,
                        message: "unterminated block".into(),
                    }),
                    None => Ok(statements),
                };
            }
        };

        let directive = match token.kind {
            TokenKind::Word(w) => w,
            TokenKind::Close if opened_at.is_some() => return Ok(statements),
            TokenKind::Close => {
                return Err(ConfigError::Syntax {
                    line: token.line,
                    message: "unexpected `}`".into(),
                });
            }
            TokenKind::Open | TokenKind::End => {
                return Err(ConfigError::Syntax {
                    line: token.line,
                    message: "expected a directive".into(),
                });
            }
        };

        let mut args = Vec::new();
        let block = loop {
            match tokens.next() {
                Some(Token {
                    kind: TokenKind::Word(w),
                    ..
                }) => args.push(w),
                Some(Token {
                    kind: TokenKind::End,
                    ..
                }) => break None,
                Some(Token {
                    kind: TokenKind::Open,
                    line,
                }) => break Some(parse_statements(tokens, Some(line))?),
                Some(Token {
                    kind: TokenKind::Close,
                    line,
                }) => {
                    return Err(ConfigError::Syntax {
                        line,
                        message: format!("missing `;` after `{}`", directive),
                    });
                }
                None => {
                    return Err(ConfigError::Syntax {
                        line: token.line,
                        message: format!("missing `;` after `{}`", directive),
                    });
                }
            }
        };

        statements.push(Statement {
            directive,
            args,
            line: token.line,
            block,
        });
    }
}

fn build_server(index: usize, block: &[Statement]) -> Result<ServerConfig, ConfigError> {
    let mut host = None;
    let mut port = None;
    let mut server_names = None;
    let mut root = None;
    let mut index_file = None;
    let mut max_body = None;
    let mut error_pages = HashMap::new();
    let mut locations = Vec::new();

    for stmt in block {
        match stmt.directive.as_str() {
            "host" => host = Some(single_arg(stmt)?.to_string()),
            "listen" => port = Some(parse_number::<u16>(stmt)?),
            "server_name" => {
                if stmt.args.is_empty() {
                    return Err(invalid(stmt));
                }
                server_names = Some(stmt.args.clone());
            }
            "root" => root = Some(PathBuf::from(single_arg(stmt)?)),
            "index" => index_file = Some(single_arg(stmt)?.to_string()),
            "client_max_body_size" => max_body = Some(parse_size(stmt)?),
            "error_page" => {
                let (page, codes) = match stmt.args.split_last() {
                    Some((page, codes)) if !codes.is_empty() => (page, codes),
                    _ => return Err(invalid(stmt)),
                };
                for code in codes {
                    let code: u16 = code.parse().map_err(|_| invalid(stmt))?;
                    if !(300..=599).contains(&code) {
                        return Err(invalid(stmt));
                    }
                    error_pages.insert(code, page.clone());
                }
            }
            "location" => {
                let block = expect_block(stmt, 1)?;
                let path = stmt.args[0].as_str();
                if !path.starts_with('/') {
                    return Err(invalid(stmt));
                }
                locations.push(build_location(path, block)?);
            }
            _ => return Err(unknown(stmt)),
        }
    }

    let missing = |directive| ConfigError::MissingDirective { index, directive };
    Ok(ServerConfig {
        server_names: server_names.ok_or_else(|| missing("server_name"))?,
        host: host.ok_or_else(|| missing("host"))?,
        port: port.ok_or_else(|| missing("listen"))?,
        root: root.ok_or_else(|| missing("root"))?,
        index: index_file.unwrap_or_else(|| DEFAULT_INDEX.to_string()),
        client_max_body_size: max_body.unwrap_or(DEFAULT_MAX_BODY_SIZE),
        error_pages,
        locations,
    })
}

fn build_location(path: &str, block: &[Statement]) -> Result<Location, ConfigError> {
    let mut location = Location::new(path);
    for stmt in block {
        match stmt.directive.as_str() {
            "allow_methods" | "methods" => {
                let mut methods = Vec::new();
                for name in &stmt.args {
                    match Method::from_token(name) {
                        m @ (Method::Get | Method::Post | Method::Delete) => {
                            if !methods.contains(&m) {
                                methods.push(m);
                            }
                        }
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                line: stmt.line,
                                directive: stmt.directive.clone(),
                                value: name.clone(),
                            });
                        }
                    }
                }
                location.methods = methods;
            }
            "root" => location.root = Some(PathBuf::from(single_arg(stmt)?)),
            "index" => location.index = Some(single_arg(stmt)?.to_string()),
            "autoindex" => location.autoindex = parse_switch(stmt)?,
            "upload_dir" => location.upload_dir = Some(PathBuf::from(single_arg(stmt)?)),
            "redirect" => location.redirect = Some(single_arg(stmt)?.to_string()),
            "cgi" => {
                let (ext, interpreter) = match stmt.args.as_slice() {
                    [ext] => (ext, None),
                    [ext, interpreter] => (ext, Some(PathBuf::from(interpreter))),
                    _ => return Err(invalid(stmt)),
                };
                let ext = if ext.starts_with('.') {
                    ext.clone()
                } else {
                    format!(".{}", ext)
                };
                location.cgi.insert(ext, interpreter);
            }
            _ => return Err(unknown(stmt)),
        }
    }
    Ok(location)
}

fn check_virtual_hosts(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    let mut seen: HashSet<(String, u16, String)> = HashSet::new();
    for server in servers {
        for name in &server.server_names {
            let key = (server.host.clone(), server.port, name.to_ascii_lowercase());
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateServer {
                    host: server.host.clone(),
                    port: server.port,
                    name: name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn expect_block(stmt: &Statement, arity: usize) -> Result<&[Statement], ConfigError> {
    match &stmt.block {
        Some(block) if stmt.args.len() == arity => Ok(block),
        Some(_) => Err(invalid(stmt)),
        None => Err(ConfigError::Syntax {
            line: stmt.line,
            message: format!("`{}` requires a block", stmt.directive),
        }),
    }
}

fn single_arg(stmt: &Statement) -> Result<&str, ConfigError> {
    if stmt.block.is_some() {
        return Err(ConfigError::Syntax {
            line: stmt.line,
            message: format!("`{}` does not take a block", stmt.directive),
        });
    }
    match stmt.args.as_slice() {
        [value] => Ok(value),
        _ => Err(invalid(stmt)),
    }
}

fn parse_number<T: std::str::FromStr>(stmt: &Statement) -> Result<T, ConfigError> {
    single_arg(stmt)?.parse().map_err(|_| invalid(stmt))
}

fn parse_switch(stmt: &Statement) -> Result<bool, ConfigError> {
    match single_arg(stmt)? {
        "on" | "true" => Ok(true),
        "off" | "false" => Ok(false),
        _ => Err(invalid(stmt)),
    }
}

/// Byte sizes with an optional `k`, `m` or `g` suffix.
fn parse_size(stmt: &Statement) -> Result<usize, ConfigError> {
    let value = single_arg(stmt)?;
    let (digits, multiplier) = match value.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&value[..value.len() - 1], 1024),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| invalid(stmt))
}

fn invalid(stmt: &Statement) -> ConfigError {
    ConfigError::InvalidValue {
        line: stmt.line,
        directive: stmt.directive.clone(),
        value: stmt.args.join(" "),
    }
}

fn unknown(stmt: &Statement) -> ConfigError {
    ConfigError::UnknownDirective {
        line: stmt.line,
        directive: stmt.directive.clone(),
    }
}
