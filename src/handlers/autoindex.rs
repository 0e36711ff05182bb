use super::{HandlerResult, io_status};
use crate::http::response::{Response, SERVER_SOFTWARE};
use crate::http::uri::{HtmlEscaped, UrlEncoded};
use std::fmt;
use std::fs::{self, DirEntry};
use std::path::Path;

struct Listing(Vec<DirEntry>);

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let max_len = self
            .0
            .iter()
            .map(|entry| entry.file_name().len())
            .max()
            .unwrap_or(2);

        writeln!(f, "<a href=\"../\">../</a>")?;

        for entry in &self.0 {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if metadata.is_dir() {
                writeln!(
                    f,
                    "<a href=\"{}/\">{}/</a>",
                    UrlEncoded(&name),
                    HtmlEscaped(&name)
                )?;
            } else {
                write!(f, "<a href=\"{}\">{}</a>", UrlEncoded(&name), HtmlEscaped(&name))?;
                let padding = max_len.saturating_sub(name.len()) + 1;
                writeln!(f, "{:pad$}{:>10}", "", metadata.len(), pad = padding)?;
            }
        }
        Ok(())
    }
}

/// HTML listing of `dir`, titled with the decoded `url_path`.
pub fn render(dir: &Path, url_path: &str) -> HandlerResult {
    let mut entries: Vec<DirEntry> = fs::read_dir(dir)
        .map_err(|e| {
            log::warn!("couldn't list {}: {}", dir.display(), e);
            io_status(&e)
        })?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    let body = format!(
        "<html>\n<head>\n<title>Index of {title}</title>\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         </head>\n<body>\n<h1>Index of {title}</h1>\n<pre>\n\
         {listing}\
         </pre>\n<hr>\n{server}\n</body>\n</html>\n",
        title = HtmlEscaped(url_path),
        listing = Listing(entries),
        server = SERVER_SOFTWARE,
    );
    Ok(Response::html(200, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_sorted_and_escaped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "12345").unwrap();
        fs::write(dir.path().join("a <x>.txt"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let response = render(dir.path(), "/files/").unwrap();
        let body = String::from_utf8(response.body).unwrap();

        assert!(body.contains("<title>Index of /files/</title>"));
        assert!(body.contains("<a href=\"a%20%3Cx%3E.txt\">a &lt;x&gt;.txt</a>"));
        assert!(body.contains("<a href=\"sub/\">sub/</a>"));
        let a = body.find("a%20").unwrap();
        let b = body.find("b.txt").unwrap();
        let sub = body.find("sub/").unwrap();
        assert!(a < b && b < sub);
    }

    #[test]
    fn missing_directory_is_404() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(render(&dir.path().join("gone"), "/gone/"), Err(404));
    }
}
