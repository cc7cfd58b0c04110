//! Leaf-certificate cache keyed by CONNECT target and SNI.
//!
//! Minting runs while the cache lock is held, probe included. That
//! serializes distinct keys too, but it is what collapses a thundering
//! herd for the same key into a single mint: concurrent callers either
//! observe the freshly inserted entry or wait for the first minter.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use osmosis_certauth::{CertificateAuthority, IssuedLeaf};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::parse_x509_certificate;

use crate::cancel::CancelToken;
use crate::config::UpstreamConfig;
use crate::errors::{ProxyError, ProxyResult};
use crate::http1::strip_port;

/// A leaf ready for TLS termination: the certificate chain and key are
/// already assembled into a rustls server config advertising h2 and
/// http/1.1.
pub struct MintedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub cert_der: CertificateDer<'static>,
    pub common_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    addr: String,
    server_name: String,
}

struct CacheEntry {
    leaf: Arc<MintedLeaf>,
    inserted_at: Instant,
}

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    last_cleanup: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub mints: u64,
}

pub struct CertCache {
    ca: Arc<CertificateAuthority>,
    probe_config: Arc<ClientConfig>,
    upstream: UpstreamConfig,
    cleanup_interval: Duration,
    cache_duration: Duration,
    state: tokio::sync::Mutex<CacheState>,
    hits: AtomicU64,
    mints: AtomicU64,
}

impl CertCache {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        probe_config: Arc<ClientConfig>,
        upstream: UpstreamConfig,
        cleanup_interval: Duration,
        cache_duration: Duration,
    ) -> Self {
        Self {
            ca,
            probe_config,
            upstream,
            cleanup_interval,
            cache_duration,
            state: tokio::sync::Mutex::new(CacheState {
                entries: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            hits: AtomicU64::new(0),
            mints: AtomicU64::new(0),
        }
    }

    /// Returns the leaf for `(addr, server_name)`, minting it on demand.
    /// A fresh mint first probes the real upstream and clones its
    /// certificate; on any probe or clone failure it falls back to a
    /// plain certificate for the host name.
    pub async fn get(
        &self,
        addr: &str,
        server_name: &str,
        cancel: &CancelToken,
    ) -> ProxyResult<Arc<MintedLeaf>> {
        let mut state = self.state.lock().await;

        if state.last_cleanup.elapsed() > self.cleanup_interval {
            let cache_duration = self.cache_duration;
            state
                .entries
                .retain(|_, entry| entry.inserted_at.elapsed() <= cache_duration);
            state.last_cleanup = Instant::now();
        }

        let key = CacheKey {
            addr: addr.to_string(),
            server_name: server_name.to_string(),
        };
        if let Some(entry) = state.entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(&entry.leaf));
        }

        let name = strip_port(addr).to_string();
        let probe_name = if server_name.is_empty() {
            name.as_str()
        } else {
            server_name
        };

        let issued = match self.probe(addr, probe_name, cancel).await {
            Ok(observed) => match self.ca.clone_observed(&observed) {
                Ok(leaf) => leaf,
                Err(error) => {
                    tracing::info!(
                        target: "osmosis::certcache",
                        "error cloning cert for {addr} ({server_name}): {error}"
                    );
                    self.mint_fallback(&name)?
                }
            },
            Err(ProxyError::Cancelled) => return Err(ProxyError::Cancelled),
            Err(error) => {
                tracing::info!(
                    target: "osmosis::certcache",
                    "error probing cert for {addr} ({server_name}): {error}"
                );
                self.mint_fallback(&name)?
            }
        };

        let leaf = Arc::new(assemble_leaf(issued, self.ca.certificate_der())?);
        self.mints.fetch_add(1, Ordering::Relaxed);
        state.entries.insert(
            key,
            CacheEntry {
                leaf: Arc::clone(&leaf),
                inserted_at: Instant::now(),
            },
        );
        Ok(leaf)
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            mints: self.mints.load(Ordering::Relaxed),
        }
    }

    fn mint_fallback(&self, name: &str) -> ProxyResult<IssuedLeaf> {
        self.ca
            .mint(name, &[name.to_string()])
            .map_err(ProxyError::from)
    }

    /// Connects to `addr`, runs a TLS client handshake with
    /// `server_name` in the hello, and returns the first non-CA
    /// certificate the peer presents.
    async fn probe(
        &self,
        addr: &str,
        server_name: &str,
        cancel: &CancelToken,
    ) -> ProxyResult<CertificateDer<'static>> {
        let probe = async {
            let tcp = tokio::time::timeout(
                self.upstream.connect_timeout,
                TcpStream::connect(addr),
            )
            .await
            .map_err(|_| timed_out("upstream connect"))??;

            let server_name = ServerName::try_from(server_name.to_string())
                .map_err(|_| ProxyError::protocol(format!("invalid SNI name {server_name:?}")))?;
            let connector = TlsConnector::from(Arc::clone(&self.probe_config));
            let tls = tokio::time::timeout(
                self.upstream.tls_handshake_timeout,
                connector.connect(server_name, tcp),
            )
            .await
            .map_err(|_| timed_out("probe handshake"))??;

            let (_, session) = tls.get_ref();
            let chain = session
                .peer_certificates()
                .ok_or_else(|| ProxyError::protocol("upstream presented no certificates"))?;
            for der in chain {
                if !is_ca_certificate(der) {
                    return Ok(der.clone().into_owned());
                }
            }
            Err(ProxyError::protocol("no leaf certificate could be found"))
        };

        tokio::select! {
            result = probe => result,
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        }
    }
}

fn assemble_leaf(
    issued: IssuedLeaf,
    ca_der: &CertificateDer<'static>,
) -> ProxyResult<MintedLeaf> {
    let chain = vec![issued.cert_der.clone(), ca_der.clone()];
    let key = PrivateKeyDer::from(issued.key_der);
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(ProxyError::certificate)?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(MintedLeaf {
        server_config: Arc::new(server_config),
        cert_der: issued.cert_der,
        common_name: issued.common_name,
    })
}

fn is_ca_certificate(der: &CertificateDer<'_>) -> bool {
    match parse_x509_certificate(der.as_ref()) {
        Ok((_, cert)) => cert
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn timed_out(stage: &str) -> ProxyError {
    ProxyError::Transport(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{stage} timed out"),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;

    use super::CertCache;
    use crate::cancel;
    use crate::config::UpstreamConfig;
    use crate::forward::build_client_config;

    fn test_cache(cleanup_interval: Duration, cache_duration: Duration) -> CertCache {
        let ca = Arc::new(
            osmosis_certauth::CertificateAuthority::generate().expect("generate ca"),
        );
        let mut upstream = UpstreamConfig::default();
        // Probes in these tests target closed ports; fail fast.
        upstream.connect_timeout = Duration::from_millis(200);
        CertCache::new(
            ca,
            build_client_config(true, false),
            upstream,
            cleanup_interval,
            cache_duration,
        )
    }

    fn test_token() -> crate::cancel::CancelToken {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        let (_abort, token) = cancel::request_scope(rx);
        token
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_lookup_hits_the_cache() {
        let cache = test_cache(Duration::from_secs(30), Duration::from_secs(600));
        let token = test_token();

        // 127.0.0.1:9 is discard; nothing listens there in the test
        // environment, so the probe fails and minting falls back.
        let first = cache.get("127.0.0.1:9", "", &token).await.expect("mint");
        let second = cache.get("127.0.0.1:9", "", &token).await.expect("hit");

        assert_eq!(first.common_name, "127.0.0.1");
        assert!(Arc::ptr_eq(&first, &second));
        let metrics = cache.metrics();
        assert_eq!(metrics.mints, 1);
        assert_eq!(metrics.hits, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_for_one_key_mint_once() {
        let cache = Arc::new(test_cache(Duration::from_secs(30), Duration::from_secs(600)));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                let token = test_token();
                cache.get("127.0.0.1:9", "one.test", &token).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("get leaf");
        }

        assert_eq!(cache.metrics().mints, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn distinct_keys_mint_distinct_leaves() {
        let cache = test_cache(Duration::from_secs(30), Duration::from_secs(600));
        let token = test_token();

        cache.get("127.0.0.1:9", "a.test", &token).await.expect("mint a");
        cache.get("127.0.0.1:9", "b.test", &token).await.expect("mint b");
        assert_eq!(cache.metrics().mints, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_entries_are_swept_and_reminted() {
        let cache = test_cache(Duration::from_millis(0), Duration::from_millis(50));
        let token = test_token();

        cache.get("127.0.0.1:9", "", &token).await.expect("mint");
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.get("127.0.0.1:9", "", &token).await.expect("remint");

        let metrics = cache.metrics();
        assert_eq!(metrics.mints, 2);
        assert_eq!(metrics.hits, 0);
    }
}
