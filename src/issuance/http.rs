use std::time::Duration;

use log::warn;
use reqwest::StatusCode;
use reqwest::blocking::{Client, ClientBuilder};

use crate::core::config::DEFAULT_HTTP_TIMEOUT_SECS;
use crate::core::context::Context;

pub const TIMEOUT_ENV: &str = "ACME_RECONCILER_HTTP_TIMEOUT_SECS";
const USER_AGENT: &str = concat!("acme-reconciler/", env!("CARGO_PKG_VERSION"));

pub fn client_builder(timeout: Duration) -> ClientBuilder {
    Client::builder().timeout(timeout).user_agent(USER_AGENT)
}

pub fn build_client(timeout: Duration) -> Client {
    client_builder(timeout)
        .build()
        .unwrap_or_else(|err| {
            warn!("[acme-http] failed to build client: {err}");
            Client::new()
        })
}

/// Environment override, then configured value, then the default; zero or
/// unparsable values fall through to the next source.
pub fn resolve_timeout(configured: u64) -> Duration {
    let from_env = std::env::var(TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok());
    match from_env {
        Some(secs) if secs > 0 => return Duration::from_secs(secs),
        Some(_) => warn!("[acme-http] invalid timeout value in {TIMEOUT_ENV}; ignoring"),
        None => {}
    }
    if configured == 0 {
        warn!("[acme-http] invalid timeout value; using default");
        return Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS);
    }
    Duration::from_secs(configured)
}

/// Per-request timeout: the client timeout capped by what is left of `ctx`.
pub fn request_timeout(ctx: &Context, client_timeout: Duration) -> Duration {
    ctx.timeout_or(client_timeout).max(Duration::from_millis(1))
}

pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn status_message(service: &str, status: StatusCode, body: Option<&str>) -> String {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return format!("{service} authentication failed");
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return format!("{service} rate limit exceeded");
    }
    match body.map(str::trim).filter(|body| !body.is_empty()) {
        Some(body) => format!("{service} API error ({status}): {body}"),
        None => format!("{service} API error: {status}"),
    }
}
