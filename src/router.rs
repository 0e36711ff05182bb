//! Maps a parsed request onto a virtual server, a location and the handler
//! that should answer it.

use crate::config::{Config, Location, ServerConfig};
use crate::http::request::{HttpRequest, Method};
use crate::http::uri::normalize_path;
use std::path::{Path, PathBuf};

/// Methods served where no location matches.
const FALLBACK_METHODS: &[Method] = &[Method::Get];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiTarget {
    pub script: PathBuf,
    pub interpreter: Option<PathBuf>,
    /// URL path of the script itself.
    pub script_name: String,
    /// URL path following the script, empty when there is none.
    pub path_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Static {
        root: PathBuf,
        path: PathBuf,
        url_path: String,
        index: String,
        autoindex: bool,
    },
    Upload {
        dir: PathBuf,
        file_name: Option<String>,
    },
    Delete {
        root: PathBuf,
        path: PathBuf,
    },
    Cgi(CgiTarget),
    Redirect(String),
    MethodNotAllowed(Vec<Method>),
    Error(u16),
}

/// Pick the server on a listener whose name matches the `Host` header,
/// falling back to the first server bound there.
pub fn select_server(config: &Config, candidates: &[usize], host: Option<&str>) -> usize {
    let fallback = candidates.first().copied().unwrap_or(0);
    let host = match host {
        Some(h) => h,
        None => return fallback,
    };
    candidates
        .iter()
        .copied()
        .find(|&idx| config.servers[idx].answers_to(host))
        .unwrap_or(fallback)
}

/// Longest location prefix matching `path` on a segment boundary.
pub fn match_location<'a>(server: &'a ServerConfig, path: &str) -> Option<&'a Location> {
    server
        .locations
        .iter()
        .filter(|loc| loc.matches(path))
        .max_by_key(|loc| loc.path.trim_end_matches('/').len())
}

pub fn route(server: &ServerConfig, request: &HttpRequest) -> Route {
    let normalized = normalize_path(&request.path);
    let location = match_location(server, normalized.as_deref().unwrap_or(&request.path));

    let allowed = location.map_or(FALLBACK_METHODS, |loc| loc.methods.as_slice());
    if !allowed.contains(&request.method) {
        return Route::MethodNotAllowed(allowed.to_vec());
    }

    let path = match normalized {
        Some(p) => p,
        None => return Route::Error(403),
    };

    if let Some(target) = location.and_then(|loc| loc.redirect.as_ref()) {
        return Route::Redirect(target.clone());
    }

    let root = location
        .and_then(|loc| loc.root.clone())
        .unwrap_or_else(|| server.root.clone());
    let fs_path = join_url_path(&root, &path);

    if let Some(loc) = location {
        if matches!(request.method, Method::Get | Method::Post) {
            match find_cgi_script(loc, &root, &path) {
                Some(Ok(target)) => return Route::Cgi(target),
                Some(Err(status)) => return Route::Error(status),
                None => {}
            }
        }
    }

    match request.method {
        Method::Get => Route::Static {
            root,
            path: fs_path,
            url_path: path,
            index: location
                .and_then(|loc| loc.index.clone())
                .unwrap_or_else(|| server.index.clone()),
            autoindex: location.is_some_and(|loc| loc.autoindex),
        },
        Method::Post => match location.and_then(|loc| loc.upload_dir.as_ref().map(|d| (loc, d))) {
            Some((loc, dir)) => Route::Upload {
                dir: dir.clone(),
                file_name: upload_file_name(loc, &path),
            },
            None => Route::Error(403),
        },
        Method::Delete => Route::Delete { root, path: fs_path },
        _ => Route::MethodNotAllowed(allowed.to_vec()),
    }
}

/// Whether `path` resolves to somewhere inside `root` once symlinks are
/// followed. Paths that do not exist are judged by their parent directory.
pub fn is_contained(root: &Path, path: &Path) -> bool {
    let root = match root.canonicalize() {
        Ok(r) => r,
        Err(_) => return false,
    };
    let resolved = match path.canonicalize() {
        Ok(p) => p,
        Err(_) => match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => match parent.canonicalize() {
                Ok(p) => p.join(name),
                Err(_) => return false,
            },
            _ => return false,
        },
    };
    resolved.starts_with(&root)
}

fn join_url_path(root: &Path, url_path: &str) -> PathBuf {
    let relative = url_path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Walk the path segments looking for one carrying a CGI extension.
fn find_cgi_script(loc: &Location, root: &Path, path: &str) -> Option<Result<CgiTarget, u16>> {
    if loc.cgi.is_empty() {
        return None;
    }
    let mut end = 0;
    for segment in path.split('/').skip(1) {
        end += 1 + segment.len();
        let ext = match segment.rfind('.') {
            Some(dot) if dot > 0 => &segment[dot..],
            _ => continue,
        };
        let interpreter = match loc.interpreter_for(ext) {
            Some(i) => i.clone(),
            None => continue,
        };
        let script_name = &path[..end];
        let script = join_url_path(root, script_name);
        if !script.is_file() {
            return Some(Err(404));
        }
        if !is_contained(root, &script) {
            log::warn!("{} resolves outside {}", script.display(), root.display());
            return Some(Err(403));
        }
        return Some(Ok(CgiTarget {
            script,
            interpreter,
            script_name: script_name.to_string(),
            path_info: path[end..].to_string(),
        }));
    }
    None
}

fn upload_file_name(loc: &Location, path: &str) -> Option<String> {
    if path.ends_with('/') {
        return None;
    }
    let rest = path.strip_prefix(loc.path.trim_end_matches('/'))?;
    let name = rest.rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_str;
    use crate::http::request::{Headers, Version};
    use std::fs;
    use test_case::test_case;

    fn request(method: Method, path: &str) -> HttpRequest {
        HttpRequest {
            method,
            target: path.to_string(),
            path: path.to_string(),
            query: String::new(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    fn config(root: &Path) -> Config {
        parse_str(&format!(
            "
server {{
    server_name main;
    host 127.0.0.1;
    listen 8080;
    root {root};
    index home.html;
    location / {{ allow_methods GET; }}
    location /upload {{
        allow_methods GET POST DELETE;
        upload_dir {root}/upload;
        autoindex on;
    }}
    location /cgi-bin {{
        allow_methods GET POST;
        cgi .py /usr/bin/python3;
    }}
    location /old {{ redirect /new; }}
    location /alt {{ root {root}/other; index alt.html; }}
}}
server {{
    server_name second;
    host 127.0.0.1;
    listen 8080;
    root {root};
}}
",
            root = root.display()
        ))
        .unwrap()
    }

    #[test]
    fn selects_server_by_host() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert_eq!(select_server(&config, &[0, 1], Some("second")), 1);
        assert_eq!(select_server(&config, &[0, 1], Some("SECOND")), 1);
        assert_eq!(select_server(&config, &[0, 1], Some("unknown")), 0);
        assert_eq!(select_server(&config, &[0, 1], None), 0);
    }

    #[test_case("/", Some("/") ; "root")]
    #[test_case("/upload", Some("/upload") ; "exact")]
    #[test_case("/upload/a.txt", Some("/upload") ; "nested")]
    #[test_case("/uploads", Some("/") ; "segment boundary")]
    #[test_case("/cgi-bin/x.py", Some("/cgi-bin") ; "cgi")]
    fn longest_prefix_wins(path: &str, expected: Option<&str>) {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let found = match_location(&config.servers[0], path).map(|l| l.path.as_str());
        assert_eq!(found, expected);
    }

    #[test]
    fn no_location_falls_back_to_get_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let server = &config.servers[1];
        match route(server, &request(Method::Get, "/")) {
            Route::Static { path, index, autoindex, .. } => {
                assert_eq!(path, dir.path());
                assert_eq!(index, "index.html");
                assert!(!autoindex);
            }
            other => panic!("unexpected route {:?}", other),
        }
        assert_eq!(
            route(server, &request(Method::Delete, "/x")),
            Route::MethodNotAllowed(vec![Method::Get])
        );
    }

    #[test_case(Method::Put ; "put")]
    #[test_case(Method::Head ; "head")]
    #[test_case(Method::Other("PATCH".into()) ; "other")]
    fn unsupported_methods_are_405(method: Method) {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert!(matches!(
            route(&config.servers[0], &request(method, "/upload/file")),
            Route::MethodNotAllowed(_)
        ));
    }

    #[test]
    fn post_to_get_only_location_is_405() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert!(matches!(
            route(&config.servers[0], &request(Method::Post, "/index.html")),
            Route::MethodNotAllowed(_)
        ));
    }

    #[test]
    fn upload_route_uses_final_segment() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let server = &config.servers[0];
        assert_eq!(
            route(server, &request(Method::Post, "/upload/a/b.txt")),
            Route::Upload {
                dir: dir.path().join("upload"),
                file_name: Some("b.txt".into()),
            }
        );
        assert_eq!(
            route(server, &request(Method::Post, "/upload/")),
            Route::Upload {
                dir: dir.path().join("upload"),
                file_name: None,
            }
        );
    }

    #[test]
    fn traversal_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert_eq!(
            route(&config.servers[0], &request(Method::Get, "/../etc/passwd")),
            Route::Error(403)
        );
    }

    #[test_case(Method::Put ; "put")]
    #[test_case(Method::Head ; "head")]
    fn method_is_checked_before_traversal(method: Method) {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert_eq!(
            route(&config.servers[0], &request(method, "/../x")),
            Route::MethodNotAllowed(vec![Method::Get])
        );
    }

    #[test]
    fn redirect_and_location_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let server = &config.servers[0];
        assert_eq!(
            route(server, &request(Method::Get, "/old/page")),
            Route::Redirect("/new".into())
        );
        match route(server, &request(Method::Get, "/alt/x.html")) {
            Route::Static { path, index, .. } => {
                assert_eq!(path, dir.path().join("other").join("alt/x.html"));
                assert_eq!(index, "alt.html");
            }
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn cgi_script_with_path_info() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("cgi-bin")).unwrap();
        fs::write(dir.path().join("cgi-bin/test.py"), "print()").unwrap();
        let config = config(dir.path());
        let server = &config.servers[0];

        match route(server, &request(Method::Get, "/cgi-bin/test.py/extra/bits")) {
            Route::Cgi(target) => {
                assert_eq!(target.script, dir.path().join("cgi-bin/test.py"));
                assert_eq!(target.interpreter, Some(PathBuf::from("/usr/bin/python3")));
                assert_eq!(target.script_name, "/cgi-bin/test.py");
                assert_eq!(target.path_info, "/extra/bits");
            }
            other => panic!("unexpected route {:?}", other),
        }
        assert_eq!(
            route(server, &request(Method::Get, "/cgi-bin/missing.py")),
            Route::Error(404)
        );
    }

    #[test]
    fn cgi_script_linked_outside_root_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("evil.py"), "print()").unwrap();
        fs::create_dir(dir.path().join("cgi-bin")).unwrap();
        let link = dir.path().join("cgi-bin/evil.py");
        std::os::unix::fs::symlink(outside.path().join("evil.py"), link).unwrap();
        let config = config(dir.path());
        assert_eq!(
            route(&config.servers[0], &request(Method::Get, "/cgi-bin/evil.py")),
            Route::Error(403)
        );
    }

    #[test]
    fn containment_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link")).unwrap();
        fs::write(dir.path().join("plain"), "x").unwrap();

        assert!(is_contained(dir.path(), &dir.path().join("plain")));
        assert!(is_contained(dir.path(), &dir.path().join("not-yet")));
        assert!(!is_contained(dir.path(), &dir.path().join("link")));
    }
}
