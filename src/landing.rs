//! Landing page under the balancer path
//!
//! Teams without a working credential, or whose instance is not ready, are
//! redirected here. Files come from the configured static directory; without
//! one, an embedded page explains the redirect reason.

use crate::config::BalancerConfig;
use crate::transport::{full_body, ProxyBody};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode, Uri};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub struct LandingPage {
    prefix: String,
    static_dir: Option<PathBuf>,
}

impl LandingPage {
    /// `prefix` must start and end with `/`
    pub fn new(prefix: impl Into<String>, static_dir: Option<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            static_dir,
        }
    }

    pub fn from_config(config: &BalancerConfig) -> Self {
        Self::new(&config.landing_path, config.static_dir.as_ref().map(PathBuf::from))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether a request path belongs to the landing page
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// The landing prefix without its trailing slash, e.g. `/balancer`
    pub fn bare_prefix(&self) -> &str {
        self.prefix.trim_end_matches('/')
    }

    pub async fn serve(&self, uri: &Uri) -> Response<ProxyBody> {
        let relative = uri.path().strip_prefix(&self.prefix).unwrap_or("");

        let Some(static_dir) = &self.static_dir else {
            if relative.is_empty() || relative == "index.html" {
                return builtin_page(uri.query());
            }
            return not_found();
        };

        let Some(path) = resolve_path(static_dir, relative) else {
            warn!(path = %uri.path(), "Rejected landing page path");
            return not_found();
        };

        match tokio::fs::read(&path).await {
            Ok(contents) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type(&path))
                .body(full_body(contents))
                .expect("valid landing response"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && relative.is_empty() => {
                debug!(dir = %static_dir.display(), "No index.html in static dir, serving built-in page");
                builtin_page(uri.query())
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Landing file not served");
                not_found()
            }
        }
    }
}

/// Map a request path under the landing prefix to a file inside `root`.
/// Returns `None` for anything that would leave the directory.
fn resolve_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(relative).ok()?;
    if decoded.contains('\0') || decoded.contains('\\') {
        return None;
    }

    let mut path = root.to_path_buf();
    for component in Path::new(decoded.as_ref()).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if decoded.is_empty() || decoded.ends_with('/') {
        path.push("index.html");
    }
    Some(path)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn not_found() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body("Not Found"))
        .expect("valid not found response")
}

fn builtin_page(query: Option<&str>) -> Response<ProxyBody> {
    let notice = notice_html(query);
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(LANDING_HTML.replace("{{notice}}", &notice)))
        .expect("valid landing response")
}

/// Paragraph describing why the visitor ended up here, if the query says
fn notice_html(query: Option<&str>) -> String {
    let mut msg = None;
    let mut team = None;
    for pair in query.unwrap_or("").split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = urlencoding::decode(value).map(|v| v.into_owned()).unwrap_or_default();
        match key {
            "msg" => msg = Some(value),
            "teamname" => team = Some(value),
            _ => {}
        }
    }

    let team = escape_html(team.as_deref().unwrap_or("your team"));
    match msg.as_deref() {
        Some("instance-restarting") => format!(
            r#"<p class="notice">The instance of <strong>{}</strong> is starting up. Try again in a few seconds.</p>"#,
            team
        ),
        Some("instance-not-found") => format!(
            r#"<p class="notice">No running instance was found for <strong>{}</strong>. Ask an organizer to (re)create it.</p>"#,
            team
        ),
        _ => String::new(),
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

const LANDING_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>teamgate</title>
    <style>
        body { font-family: system-ui, sans-serif; background: #1b1b1f; color: #e8e8ea; margin: 0; }
        main { max-width: 36rem; margin: 10vh auto; padding: 2rem; background: #26262c; border-radius: 8px; }
        h1 { margin-top: 0; font-size: 1.5rem; }
        .notice { padding: 0.75rem 1rem; background: #4a3b12; border-left: 4px solid #f0b429; border-radius: 4px; }
        code { background: #33333a; padding: 0.1rem 0.3rem; border-radius: 3px; }
    </style>
</head>
<body>
    <main>
        <h1>Team instances</h1>
        {{notice}}
        <p>Each team gets its own application instance. Join a team to receive a
        credential cookie, then open any page on this host to reach your instance.</p>
        <p>If you were just sent here, your credential is missing or your instance is
        not ready yet.</p>
    </main>
</body>
</html>
"##;
