//! Server configuration.

use clap::Parser;

/// wsbridge - expose HTTP upstreams over a JSON-RPC WebSocket.
#[derive(Parser, Debug, Clone)]
#[command(name = "bridge-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// host:port to listen on
    #[arg(long, env = "BRIDGE_LISTEN", default_value = "0.0.0.0:6066")]
    pub listen: String,

    /// If not empty, requests without a specified host are proxied to this host
    #[arg(long, env = "BRIDGE_DEFAULT_HOST", default_value = "")]
    pub default_host: String,

    /// Timeout for proxied HTTP requests, in seconds
    #[arg(long, env = "BRIDGE_TIMEOUT_SECONDS", default_value = "60")]
    pub timeout_seconds: u64,

    /// Comma-separated list of allowed upstream hosts (empty allows any)
    #[arg(long, env = "BRIDGE_UPSTREAM_HOST_WHITELIST", default_value = "")]
    pub upstream_host_whitelist: String,

    /// Comma-separated list of allowed origin host suffixes (empty allows any)
    #[arg(long, env = "BRIDGE_ORIGIN_WHITELIST", default_value = "")]
    pub origin_whitelist: String,

    /// If greater than 0, skip the upstream call and report a synthetic
    /// bad-gateway failure after sleeping this many milliseconds
    #[arg(long, env = "BRIDGE_FAKE_UPSTREAM_RESPONSE_TIME_MS", default_value = "0")]
    pub fake_upstream_response_time_ms: u64,

    /// If greater than 0, RPS per client is limited to this number (by
    /// blocking for the remainder of the current second at the limit)
    #[arg(long, env = "BRIDGE_THROTTLE_RPS_PER_CLIENT", default_value = "50")]
    pub throttle_rps_per_client: i64,

    /// If greater than 0, in-flight requests per client are limited to this
    /// number (same blocking scheme)
    #[arg(
        long,
        env = "BRIDGE_THROTTLE_CONCURRENT_REQUESTS_PER_CLIENT",
        default_value = "10"
    )]
    pub throttle_concurrent_requests_per_client: i64,

    /// Log connection opening/closing
    #[arg(long, env = "BRIDGE_LOG_CONNECTIONS")]
    pub log_connections: bool,

    /// Log input/output errors on client sockets
    #[arg(long, env = "BRIDGE_LOG_CLIENT_IO_ERRORS")]
    pub log_client_io_errors: bool,

    /// Enable debug logging
    #[arg(long, env = "BRIDGE_DEBUG")]
    pub debug: bool,
}

/// Immutable proxying parameters, derived once from the flag surface.
#[derive(Debug, Clone, Default)]
pub struct ProxyParams {
    /// Host substituted into path-only requests; empty means each request
    /// must name its own host.
    pub default_host: String,
    /// Exact-match upstream host whitelist; empty allows any host.
    pub whitelisted_upstream_hosts: Vec<String>,
    /// Origin suffix whitelist for the WebSocket endpoint; empty allows any.
    pub whitelisted_origins: Vec<String>,
}

impl ProxyParams {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            default_host: config.default_host.clone(),
            whitelisted_upstream_hosts: split_comma_list(&config.upstream_host_whitelist),
            whitelisted_origins: split_comma_list(&config.origin_whitelist),
        }
    }
}

/// An empty input is an empty list, not one empty entry.
fn split_comma_list(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',').map(str::to_owned).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_comma_list() {
        assert!(split_comma_list("").is_empty());
        assert_eq!(split_comma_list("a.com"), vec!["a.com"]);
        assert_eq!(split_comma_list("a.com,b.com"), vec!["a.com", "b.com"]);
        // entries are kept verbatim, empties included
        assert_eq!(split_comma_list("a.com,"), vec!["a.com", ""]);
    }

    #[test]
    fn test_params_from_config() {
        let config = ServerConfig::parse_from([
            "bridge-server",
            "--default-host",
            "example.com",
            "--upstream-host-whitelist",
            "a.com,b.com:8080",
        ]);
        let params = ProxyParams::from_config(&config);
        assert_eq!(params.default_host, "example.com");
        assert_eq!(params.whitelisted_upstream_hosts, vec!["a.com", "b.com:8080"]);
        assert!(params.whitelisted_origins.is_empty());
    }
}
