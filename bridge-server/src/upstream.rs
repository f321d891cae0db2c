//! The shared outbound HTTP client.

use std::time::Duration;

/// Build the process-wide client for proxied requests. One deadline covers
/// connecting, one covers the whole exchange; both come from
/// `--timeout-seconds`.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_http_client() {
        build_http_client(Duration::from_secs(60)).unwrap();
    }
}
