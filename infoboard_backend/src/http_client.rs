use std::time::Duration;

use anyhow::{anyhow, Result};

/// Outbound client for upstream traffic. System proxy discovery stays off
/// unless `INFOBOARD_ENABLE_SYSTEM_PROXY` is set, since the proxy usually
/// talks to a loopback backend.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> Result<reqwest::Client> {
    if system_proxy_enabled(std::env::var("INFOBOARD_ENABLE_SYSTEM_PROXY").ok()) {
        if let Ok(Ok(client)) = std::panic::catch_unwind(|| attempt_build(timeout, false)) {
            return Ok(client);
        }

        tracing::warn!(
            "HTTP client initialization with system proxy discovery failed; retrying with no_proxy"
        );
    }

    match std::panic::catch_unwind(|| attempt_build(timeout, true)) {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(error)) => Err(anyhow!(
            "Failed to initialize HTTP client (no_proxy fallback returned error): {}",
            error
        )),
        Err(_) => Err(anyhow!(
            "Failed to initialize HTTP client (no_proxy fallback panicked)"
        )),
    }
}

fn system_proxy_enabled(raw: Option<String>) -> bool {
    raw.map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    // Upstream redirects are relayed to the caller, not followed.
    let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
