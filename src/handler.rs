use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{Local, SecondsFormat};
use http::{header, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{Request, Response};
use serde_json::json;
use tracing::{error, info};
use url::Url;

use crate::state::ServiceState;

pub const SERVICE_NAME: &str = "Short Link Proxy";
const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";
const SAMPLE_MAPPINGS: usize = 5;

/// Route a request coming off the virtual listener
pub async fn handle<B>(
    req: Request<B>,
    state: Arc<ServiceState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    match req.uri().path() {
        "/check" | "/health" => return Ok(check_response(&state).await),
        "/proxy.pac" => return Ok(pac_response(state.config.port())),
        _ => {}
    }

    // Health checks and PAC fetches are not counted
    state.record_request();

    let requested_host = match request_host(&req) {
        Some(host) => host,
        None => {
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "Host header is required".to_string(),
            ))
        }
    };

    let mappings = state.mappings.snapshot().await;
    let target = match mappings.lookup(&requested_host) {
        Some(target) => target,
        None => {
            info!(
                "No mapping found for host: {}. Returning 404.",
                requested_host
            );
            return Ok(text_response(
                StatusCode::NOT_FOUND,
                format!("No short link mapping found for \"{}\"", requested_host),
            ));
        }
    };

    let uri = req.uri();
    match compose_redirect(target, uri.path(), uri.query(), None) {
        Ok(location) => {
            info!("Redirecting {}{} -> {}", requested_host, uri, location);
            Ok(redirect_response(&location))
        }
        Err(e) => {
            error!("Invalid target URL for host {}: {}", requested_host, e);
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal configuration error".to_string(),
            ))
        }
    }
}

/// Lower-cased host the client asked for, without any port.
///
/// Absolute-form request targets win over the Host header, as they do for
/// any HTTP/1.1 server.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => req
            .headers()
            .get(header::HOST)?
            .to_str()
            .ok()?
            .to_string(),
    };
    if raw.is_empty() {
        return None;
    }
    Some(strip_port(&raw).to_ascii_lowercase())
}

/// Drop a trailing `:port`, keeping bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &host[..end + 2];
        }
        return host;
    }
    match host.find(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

/// Join a stored target URL with the request path, query and fragment.
///
/// The target's path and the request path are joined with exactly one `/`
/// and runs of slashes are collapsed. The request's query and fragment
/// replace whatever the target carried.
pub fn compose_redirect(
    target: &str,
    path: &str,
    query: Option<&str>,
    fragment: Option<&str>,
) -> Result<String, url::ParseError> {
    let mut url = Url::parse(target)?;
    if url.cannot_be_a_base() {
        return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
    }

    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&collapse_slashes(&joined));
    url.set_query(None);
    url.set_fragment(None);

    // Query and fragment are appended raw; `Url` would re-encode them
    let mut location: String = url.into();
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        location.push('?');
        location.push_str(query);
    }
    if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
        location.push('#');
        location.push_str(fragment);
    }
    Ok(location)
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(c);
    }
    out
}

async fn check_response(state: &ServiceState) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mappings = state.mappings.snapshot().await;
    let now = Local::now();

    let (last_load, last_load_ago) = match mappings.loaded_at() {
        Some(at) => (
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            format_duration((now - at).to_std().unwrap_or_default()),
        ),
        None => ("never".to_string(), "never".to_string()),
    };

    let samples: Vec<_> = mappings
        .samples(SAMPLE_MAPPINGS)
        .into_iter()
        .map(|(short, target)| json!({ "short": short, "target": target }))
        .collect();

    let body = json!({
        "status": "running",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "request_count": state.request_count(),
        "active_connections": state.connections.active_count(),
        "uptime": format_duration(state.uptime()),
        "mappings": {
            "total": mappings.len(),
            "last_load": last_load,
            "last_load_ago": last_load_ago,
        },
        "config": {
            "port": state.config.port(),
            "config_file": state.config.config_file.display().to_string(),
        },
        "timestamp": now.to_rfc3339_opts(SecondsFormat::Secs, true),
        "note": "Send SIGUSR1 to reload config: kill -USR1 <pid>",
        "sample_mappings": samples,
    });

    let mut resp = Response::new(full(body.to_string()));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    resp
}

/// PAC script sending dot-free hosts through our SOCKS5 port
pub fn pac_script(port: u16) -> String {
    format!(
        r#"function FindProxyForURL(url, host) {{
    var safeHost = host.toLowerCase();
    // If it's a plain hostname (no dots), use our proxy
    if (safeHost.indexOf('.') === -1) {{
        return "SOCKS5 127.0.0.1:{port}; SOCKS 127.0.0.1:{port}; DIRECT";
    }}
    return "DIRECT";
}}"#
    )
}

fn pac_response(port: u16) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(pac_script(port)));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(PAC_CONTENT_TYPE),
    );
    resp
}

fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!("<a href=\"{}\">Found</a>.\n", location);
    let mut resp = Response::new(full(body));
    *resp.status_mut() = StatusCode::FOUND;
    let headers = resp.headers_mut();
    match header::HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(header::LOCATION, value);
        }
        Err(_) => {
            error!("Composed redirect is not a valid header value: {}", location);
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal configuration error".to_string(),
            );
        }
    }
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    resp
}

fn text_response(status: StatusCode, msg: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(format!("{}\n", msg)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Compact `1h2m3s` style rendering
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}.{:03}s", s, d.subsec_millis())
    }
}
