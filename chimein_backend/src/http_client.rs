use std::time::Duration;

use anyhow::{Context, Result};

/// Request timeout for oracle and transport calls when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub fn build_http_client() -> Result<reqwest::Client> {
    build_http_client_with_timeout(Some(DEFAULT_REQUEST_TIMEOUT))
}

/// System proxy discovery is opt-in through `CHIMEIN_ENABLE_SYSTEM_PROXY`;
/// when it fails the client is rebuilt with proxies disabled.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> Result<reqwest::Client> {
    if system_proxy_enabled() {
        match attempt_build(timeout, false) {
            Ok(client) => return Ok(client),
            Err(e) => tracing::warn!(
                "HTTP client with system proxy discovery failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    attempt_build(timeout, true).context("Failed to initialize HTTP client")
}

fn system_proxy_enabled() -> bool {
    std::env::var("CHIMEIN_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
