use std::time::Duration;

use reqwest::blocking::Client;

/// Build the blocking client used for engine traffic.
///
/// System proxy discovery is opt-in (`PENELOPE_ENABLE_SYSTEM_PROXY=1`): the
/// engine is almost always on localhost, and some platforms fail proxy
/// discovery outright.
pub fn build_http_client(timeout: Option<Duration>) -> Result<Client, reqwest::Error> {
    let allow_system_proxy = std::env::var("PENELOPE_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(timeout, false) {
            Ok(client) => return Ok(client),
            Err(e) => tracing::warn!(
                "HTTP client initialization with system proxy discovery failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    attempt_build(timeout, true)
}

fn attempt_build(timeout: Option<Duration>, no_proxy: bool) -> Result<Client, reqwest::Error> {
    // Streams stay open for the whole completion; the timeout is opt-in.
    let mut builder = Client::builder().timeout(timeout);
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
