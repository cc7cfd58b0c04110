//! The shared upstream client.
//!
//! One client serves every request the proxy forwards: HTTP/1.1 over a
//! per-destination idle pool, HTTP/2 over shared per-destination
//! connections when TLS negotiates it, environment proxy variables
//! honored, redirects returned verbatim to the inbound client.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::body::{Http1Body, Http1Pool, PoolKey, ResponseBody, UpstreamStream};
use crate::config::UpstreamConfig;
use crate::errors::{h2_error, ProxyError, ProxyResult};
use crate::event::{header_map_from_list, Event, ProxyResponse, Scheme};
use crate::http1::{
    parse_response_head, read_until_pattern, strip_port, write_request_head, BufferedConn,
    HeaderList,
};
use crate::pipeline::ForwardAction;

/// Headers that must not travel on an HTTP/2 request stream.
const H2_STRIP_HEADERS: [&str; 6] = [
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
];

pub struct UpstreamClient {
    config: UpstreamConfig,
    /// TLS config advertising h2 and http/1.1.
    tls_alpn: Arc<ClientConfig>,
    /// TLS config pinned to http/1.1, for WebSocket dials.
    tls_h1: Arc<ClientConfig>,
    pool: Arc<Http1Pool>,
    h2_pool: tokio::sync::Mutex<HashMap<PoolKey, h2::client::SendRequest<Bytes>>>,
    env_proxy: EnvProxy,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let env_proxy = if config.use_env_proxy {
            EnvProxy::from_env()
        } else {
            EnvProxy::default()
        };
        Self {
            tls_alpn: build_client_config(config.insecure_skip_verify, true),
            tls_h1: build_client_config(config.insecure_skip_verify, false),
            pool: Arc::new(Http1Pool::new(config.idle_connection_timeout)),
            h2_pool: tokio::sync::Mutex::new(HashMap::new()),
            env_proxy,
            config,
        }
    }

    /// TLS configuration for outbound WebSocket dials.
    pub(crate) fn websocket_tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls_h1)
    }

    pub(crate) fn probe_tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls_h1)
    }

    /// Opens a TCP connection with the connect timeout and keep-alive
    /// applied. Used for forwarded requests and WebSocket dials alike.
    pub(crate) async fn dial(&self, addr: &str) -> ProxyResult<TcpStream> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("upstream connect"))??;

        let keepalive = socket2::TcpKeepalive::new().with_time(self.config.tcp_keepalive);
        socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Performs the upstream round-trip for a prepared event.
    pub async fn round_trip(&self, event: &mut Event) -> ProxyResult<ProxyResponse> {
        let token = event.cancel_token();
        tokio::select! {
            result = self.round_trip_inner(event) => result,
            _ = token.cancelled() => Err(ProxyError::Cancelled),
        }
    }

    async fn round_trip_inner(&self, event: &mut Event) -> ProxyResult<ProxyResponse> {
        let scheme = event.effective_scheme();
        let authority = event.effective_authority()?;
        let authority = with_default_port(&authority, scheme);
        let via_proxy = self.env_proxy.proxy_for(scheme, strip_port(&authority));

        match scheme {
            Scheme::Https => {
                self.https_round_trip(event, authority, via_proxy).await
            }
            Scheme::Http => {
                let key = PoolKey {
                    scheme,
                    authority: authority.clone(),
                    via_proxy: via_proxy.clone(),
                };
                // An idle connection may have been closed by the server
                // while parked; retry such failures once on a fresh dial.
                if let Some(conn) = self.pool.checkout(&key) {
                    match self.h1_round_trip(event, key.clone(), conn).await {
                        Err(ProxyError::Transport(error)) if is_stale_conn_error(&error) => {
                            tracing::debug!(
                                target: "osmosis::forward",
                                "pooled connection to {authority} was stale, redialing"
                            );
                        }
                        other => return other,
                    }
                }
                let target = via_proxy.as_deref().unwrap_or(&authority);
                let conn = BufferedConn::new(UpstreamStream::Tcp(self.dial(target).await?));
                self.h1_round_trip(event, key, conn).await
            }
        }
    }

    async fn https_round_trip(
        &self,
        event: &mut Event,
        authority: String,
        via_proxy: Option<String>,
    ) -> ProxyResult<ProxyResponse> {
        let key = PoolKey {
            scheme: Scheme::Https,
            authority: authority.clone(),
            via_proxy: via_proxy.clone(),
        };

        // A live HTTP/2 connection to this destination multiplexes every
        // request; try it before opening anything new.
        if let Some(sender) = self.checkout_h2(&key).await {
            match self.h2_round_trip(event, &authority, sender).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    self.drop_h2(&key).await;
                    tracing::debug!(
                        target: "osmosis::forward",
                        "pooled HTTP/2 connection to {authority} failed, redialing: {error}"
                    );
                }
            }
        }

        if let Some(conn) = self.pool.checkout(&key) {
            match self.h1_round_trip(event, key.clone(), conn).await {
                Err(ProxyError::Transport(error)) if is_stale_conn_error(&error) => {
                    tracing::debug!(
                        target: "osmosis::forward",
                        "pooled TLS connection to {authority} was stale, redialing"
                    );
                }
                other => return other,
            }
        }

        let (tls, is_h2) = self.establish_tls(&authority, via_proxy.as_deref()).await?;
        if is_h2 {
            let sender = self.install_h2(&key, tls).await?;
            return self.h2_round_trip(event, &authority, sender).await;
        }
        self.h1_round_trip(event, key, BufferedConn::new(tls))
            .await
    }

    async fn establish_tls(
        &self,
        authority: &str,
        via_proxy: Option<&str>,
    ) -> ProxyResult<(UpstreamStream, bool)> {
        let tcp = match via_proxy {
            Some(proxy_addr) => {
                let tcp = self.dial(proxy_addr).await?;
                self.connect_through_proxy(tcp, authority).await?
            }
            None => self.dial(authority).await?,
        };

        let host = strip_port(authority).to_string();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| ProxyError::protocol(format!("invalid upstream host {host:?}")))?;
        let connector = TlsConnector::from(Arc::clone(&self.tls_alpn));
        let tls = tokio::time::timeout(
            self.config.tls_handshake_timeout,
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| timed_out("upstream TLS handshake"))??;

        let is_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2");
        Ok((UpstreamStream::Tls(Box::new(tls)), is_h2))
    }

    /// Establishes a tunnel through the environment-configured proxy.
    async fn connect_through_proxy(
        &self,
        tcp: TcpStream,
        authority: &str,
    ) -> ProxyResult<TcpStream> {
        let mut conn = BufferedConn::new(tcp);
        let mut head = Vec::with_capacity(128);
        let headers = {
            let mut list = HeaderList::new();
            list.push("Host", authority);
            list
        };
        write_request_head(&mut head, "CONNECT", authority, &headers);
        conn.stream.write_all(&head).await?;

        let raw = tokio::time::timeout(
            self.config.response_header_timeout,
            read_until_pattern(&mut conn, b"\r\n\r\n", 16 * 1024),
        )
        .await
        .map_err(|_| timed_out("proxy CONNECT response"))??
        .ok_or_else(|| {
            ProxyError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed during CONNECT",
            ))
        })?;
        let parsed = parse_response_head(&raw, "CONNECT")?;
        if !(200..300).contains(&parsed.status) {
            return Err(ProxyError::protocol(format!(
                "proxy refused CONNECT with status {}",
                parsed.status
            )));
        }
        if !conn.read_buf.is_empty() {
            return Err(ProxyError::protocol(
                "proxy sent unexpected bytes after CONNECT response",
            ));
        }
        Ok(conn.stream)
    }

    async fn h1_round_trip(
        &self,
        event: &mut Event,
        key: PoolKey,
        mut conn: BufferedConn<UpstreamStream>,
    ) -> ProxyResult<ProxyResponse> {
        // Behind an environment proxy, plain requests go out in
        // absolute-form; everywhere else the target is origin-form.
        let target = if key.scheme == Scheme::Http && key.via_proxy.is_some() {
            format!("http://{}{}", key.authority, event.request.path_and_query())
        } else {
            event.request.path_and_query()
        };

        let mut wire = Vec::with_capacity(512 + event.request.body.len());
        write_request_head(&mut wire, &event.request.method, &target, &event.request.headers);
        wire.extend_from_slice(&event.request.body);
        conn.stream.write_all(&wire).await?;
        conn.stream.flush().await?;

        let head = loop {
            let raw = tokio::time::timeout(
                self.config.response_header_timeout,
                read_until_pattern(&mut conn, b"\r\n\r\n", 64 * 1024),
            )
            .await
            .map_err(|_| timed_out("upstream response headers"))??
            .ok_or_else(|| {
                ProxyError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed before sending response headers",
                ))
            })?;

            let parsed = parse_response_head(&raw, &event.request.method)?;
            // Informational responses other than 101 are interim; keep
            // reading for the real one.
            if (100..200).contains(&parsed.status) && parsed.status != 101 {
                continue;
            }
            break parsed;
        };

        let reusable = !head.connection_close;
        let body = Http1Body::new(
            conn,
            key,
            Some(Arc::clone(&self.pool)),
            head.body_mode,
            reusable,
        );

        Ok(ProxyResponse {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            body: ResponseBody::http1(body),
        })
    }

    async fn checkout_h2(&self, key: &PoolKey) -> Option<h2::client::SendRequest<Bytes>> {
        self.h2_pool.lock().await.get(key).cloned()
    }

    async fn drop_h2(&self, key: &PoolKey) {
        self.h2_pool.lock().await.remove(key);
    }

    async fn install_h2(
        &self,
        key: &PoolKey,
        tls: UpstreamStream,
    ) -> ProxyResult<h2::client::SendRequest<Bytes>> {
        let mut builder = h2::client::Builder::new();
        builder.initial_window_size(1024 * 1024);
        builder.initial_connection_window_size(4 * 1024 * 1024);
        let (sender, connection) = builder
            .handshake(tls)
            .await
            .map_err(|error| h2_error("upstream HTTP/2 handshake", error))?;

        let authority = key.authority.clone();
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::debug!(
                    target: "osmosis::forward",
                    "HTTP/2 connection to {authority} ended: {error}"
                );
            }
        });

        self.h2_pool
            .lock()
            .await
            .insert(key.clone(), sender.clone());
        Ok(sender)
    }

    async fn h2_round_trip(
        &self,
        event: &mut Event,
        authority: &str,
        sender: h2::client::SendRequest<Bytes>,
    ) -> ProxyResult<ProxyResponse> {
        let uri = format!("https://{authority}{}", event.request.path_and_query())
            .parse::<http::Uri>()
            .map_err(|error| ProxyError::protocol(format!("upstream URL: {error}")))?;

        let mut headers = event.request.headers.clone();
        for name in H2_STRIP_HEADERS {
            headers.remove(name);
        }

        let mut builder = http::Request::builder()
            .method(event.request.method.as_str())
            .uri(uri);
        if let Some(map) = builder.headers_mut() {
            *map = header_map_from_list(&headers);
        }
        let request = builder
            .body(())
            .map_err(|error| ProxyError::protocol(format!("upstream request: {error}")))?;

        let body = event.request.body.clone();
        let end_stream = body.is_empty();

        let mut ready = sender
            .ready()
            .await
            .map_err(|error| h2_error("upstream HTTP/2 sender", error))?;
        let (response_future, mut request_stream) = ready
            .send_request(request, end_stream)
            .map_err(|error| h2_error("sending HTTP/2 request", error))?;
        if !end_stream {
            send_h2_data(&mut request_stream, body, true).await?;
        }

        let response = tokio::time::timeout(self.config.response_header_timeout, response_future)
            .await
            .map_err(|_| timed_out("upstream HTTP/2 response"))?
            .map_err(|error| h2_error("awaiting HTTP/2 response", error))?;

        let (parts, recv_stream) = response.into_parts();
        Ok(ProxyResponse {
            status: parts.status.as_u16(),
            reason: String::new(),
            version: crate::http1::HttpVersion::H2,
            headers: crate::event::header_list_from_map(&parts.headers),
            body: ResponseBody::h2(recv_stream),
        })
    }
}

impl ForwardAction for UpstreamClient {
    fn forward<'a>(&'a self, event: &'a mut Event) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
        Box::pin(async move {
            event.prepare_request()?;
            self.round_trip(event).await
        })
    }
}

/// Sends a byte buffer on an HTTP/2 stream, waiting for window capacity
/// as needed.
pub(crate) async fn send_h2_data(
    sink: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end_stream: bool,
) -> ProxyResult<()> {
    if data.is_empty() {
        sink.send_data(data, end_stream)
            .map_err(|error| h2_error("sending HTTP/2 data frame", error))?;
        return Ok(());
    }

    while !data.is_empty() {
        sink.reserve_capacity(data.len());
        let capacity = std::future::poll_fn(|cx| sink.poll_capacity(cx))
            .await
            .ok_or_else(|| {
                ProxyError::Transport(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "HTTP/2 stream closed before capacity became available",
                ))
            })?
            .map_err(|error| h2_error("polling HTTP/2 send capacity", error))?;
        if capacity == 0 {
            continue;
        }
        let chunk = data.split_to(capacity.min(data.len()));
        let is_last = data.is_empty();
        sink.send_data(chunk, end_stream && is_last)
            .map_err(|error| h2_error("sending HTTP/2 data frame", error))?;
    }
    Ok(())
}

/// Builds the rustls client configuration used for upstream handshakes.
/// With `insecure_skip_verify` the proxy accepts any upstream
/// certificate, which is the normal interception posture.
pub(crate) fn build_client_config(insecure_skip_verify: bool, alpn_h2: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerify))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = if alpn_h2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Arc::new(config)
}

pub(crate) fn with_default_port(authority: &str, scheme: Scheme) -> String {
    let has_port = if authority.starts_with('[') {
        authority.rsplit_once(']').is_some_and(|(_, rest)| rest.starts_with(':'))
    } else {
        authority
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty())
    };
    if has_port {
        authority.to_string()
    } else {
        format!("{authority}:{}", scheme.default_port())
    }
}

#[derive(Debug, Clone, Default)]
struct EnvProxy {
    http: Option<String>,
    https: Option<String>,
    no_proxy: Vec<String>,
}

impl EnvProxy {
    fn from_env() -> Self {
        Self {
            http: read_proxy_var("HTTP_PROXY").or_else(|| read_proxy_var("http_proxy")),
            https: read_proxy_var("HTTPS_PROXY").or_else(|| read_proxy_var("https_proxy")),
            no_proxy: std::env::var("NO_PROXY")
                .or_else(|_| std::env::var("no_proxy"))
                .map(|value| {
                    value
                        .split(',')
                        .map(|entry| entry.trim().to_ascii_lowercase())
                        .filter(|entry| !entry.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn proxy_for(&self, scheme: Scheme, host: &str) -> Option<String> {
        let configured = match scheme {
            Scheme::Http => self.http.as_ref(),
            Scheme::Https => self.https.as_ref(),
        }?;
        if self.is_excluded(host) {
            return None;
        }
        Some(configured.clone())
    }

    fn is_excluded(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.no_proxy.iter().any(|entry| {
            entry == "*"
                || host == *entry
                || host.ends_with(&format!(".{}", entry.trim_start_matches('.')))
        })
    }
}

fn read_proxy_var(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let value = value
        .strip_prefix("http://")
        .or_else(|| value.strip_prefix("https://"))
        .unwrap_or(value);
    let value = value.trim_end_matches('/');
    Some(with_default_port(value, Scheme::Http))
}

#[derive(Debug)]
struct InsecureSkipVerify;

impl ServerCertVerifier for InsecureSkipVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

fn timed_out(stage: &str) -> ProxyError {
    ProxyError::Transport(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{stage} timed out"),
    ))
}

fn is_stale_conn_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::{with_default_port, EnvProxy};
    use crate::event::Scheme;

    #[test]
    fn default_ports_are_appended() {
        assert_eq!(with_default_port("echo.test", Scheme::Http), "echo.test:80");
        assert_eq!(
            with_default_port("echo.test", Scheme::Https),
            "echo.test:443"
        );
        assert_eq!(
            with_default_port("echo.test:8443", Scheme::Https),
            "echo.test:8443"
        );
        assert_eq!(
            with_default_port("[::1]:8080", Scheme::Http),
            "[::1]:8080"
        );
    }

    #[test]
    fn no_proxy_excludes_hosts_and_subdomains() {
        let env = EnvProxy {
            http: Some("proxy.corp:3128".to_string()),
            https: None,
            no_proxy: vec!["internal.test".to_string()],
        };
        assert_eq!(env.proxy_for(Scheme::Http, "internal.test"), None);
        assert_eq!(env.proxy_for(Scheme::Http, "api.internal.test"), None);
        assert_eq!(
            env.proxy_for(Scheme::Http, "echo.test"),
            Some("proxy.corp:3128".to_string())
        );
        assert_eq!(env.proxy_for(Scheme::Https, "echo.test"), None);
    }
}
