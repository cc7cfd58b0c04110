use std::net::SocketAddr;
use std::time::Duration;

use crate::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub bind: SocketAddr,
    pub upstream: UpstreamConfig,
    /// Sweep cadence for the certificate cache.
    pub cert_cache_cleanup_interval: Duration,
    /// Lifetime of a cached leaf, measured from insertion.
    pub cert_cache_duration: Duration,
    pub max_head_bytes: usize,
    /// Request bodies are buffered so hooks can replay them; this bounds
    /// the buffer.
    pub max_buffered_body_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub tls_handshake_timeout: Duration,
    pub response_header_timeout: Duration,
    pub expect_continue_timeout: Duration,
    pub idle_connection_timeout: Duration,
    /// Accept any upstream certificate. The proxy exists to impersonate
    /// servers, so validity enforcement is the operator's call.
    pub insecure_skip_verify: bool,
    /// Honor HTTP_PROXY / HTTPS_PROXY / NO_PROXY from the environment.
    pub use_env_proxy: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: "[::1]:8080".parse().expect("default bind address must parse"),
            upstream: UpstreamConfig::default(),
            cert_cache_cleanup_interval: Duration::from_secs(30),
            cert_cache_duration: Duration::from_secs(10 * 60),
            max_head_bytes: 64 * 1024,
            max_buffered_body_bytes: 32 * 1024 * 1024,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            tcp_keepalive: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(30),
            response_header_timeout: Duration::from_secs(60),
            expect_continue_timeout: Duration::from_secs(5),
            idle_connection_timeout: Duration::from_secs(60),
            insecure_skip_verify: true,
            use_env_proxy: true,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.max_head_bytes == 0 {
            return Err(ProxyError::protocol("max_head_bytes must be non-zero"));
        }
        if self.max_buffered_body_bytes == 0 {
            return Err(ProxyError::protocol(
                "max_buffered_body_bytes must be non-zero",
            ));
        }
        if self.cert_cache_duration.is_zero() {
            return Err(ProxyError::protocol("cert_cache_duration must be non-zero"));
        }
        Ok(())
    }
}
