//! Base URL resolution for calls back into this API.

use url::Url;

/// Fallback port when neither `PORT` nor `NEXT_PUBLIC_PORT` is set.
pub const DEFAULT_LOCAL_PORT: &str = "3001";

/// Environment-provided fallbacks, captured once at startup so that
/// resolution itself stays pure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlEnv {
    pub vercel_url: Option<String>,
    pub port: Option<String>,
    pub public_port: Option<String>,
}

/// Where the caller is running when it needs the API base URL.
#[derive(Debug, Clone)]
pub enum ExecutionContext<'a> {
    /// Running in a browser; carries the current page location.
    Browser { location: &'a Url },
    /// Handling a server-side request; carries the absolute request URL.
    ServerRequest { url: &'a Url },
    /// No location information available.
    Detached,
}

pub fn api_base_url(context: &ExecutionContext<'_>, env: &UrlEnv) -> String {
    match context {
        ExecutionContext::Browser { location } | ExecutionContext::ServerRequest { url: location } => {
            origin_of(location).unwrap_or_else(|| fallback_base_url(env))
        }
        ExecutionContext::Detached => fallback_base_url(env),
    }
}

/// Joins `path` onto `base`, making sure it lives under `/api/`.
pub fn api_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with("/api/") {
        format!("{}{}", base, path)
    } else {
        format!("{}/api/{}", base, path.trim_start_matches('/'))
    }
}

fn origin_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let mut origin = format!("{}://{}", url.scheme(), host);
    // `Url::port` is None for the scheme's default port.
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{}", port));
    }
    Some(origin)
}

fn fallback_base_url(env: &UrlEnv) -> String {
    if let Some(vercel) = env.vercel_url.as_deref() {
        return format!("https://{}", vercel);
    }
    let port = env
        .port
        .as_deref()
        .or(env.public_port.as_deref())
        .unwrap_or(DEFAULT_LOCAL_PORT);
    format!("http://127.0.0.1:{}", port)
}
