//! The per-request context traversing the hook pipeline.
//!
//! An [`Event`] wraps one inbound request together with the proxy context
//! it needs downstream: the request id, the client address, the force
//! overrides pinned by the CONNECT handler, and a cancellation scope.
//! Hooks observe and rewrite requests and responses through the raw-bytes
//! views; the buffered representations make those views replayable.

use bytes::Bytes;
use tokio::sync::watch;

use crate::body::ResponseBody;
use crate::cancel::{self, AbortHandle, CancelToken};
use crate::errors::{ProxyError, ProxyResult};
use crate::http1::{
    parse_request_head, parse_response_head, split_head, write_request_head, write_response_head,
    HeaderList, HttpVersion,
};

/// Effective URL scheme of a forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// Header names never forwarded to the upstream server.
const FILTER_HEADERS: [&str; 2] = ["proxy-connection", "connection"];

/// Mixed-case spellings that normalizing intermediaries destroy and
/// picky WebSocket servers expect.
const RENAME_HEADERS: [(&str, &str); 4] = [
    ("sec-websocket-key", "Sec-WebSocket-Key"),
    ("sec-websocket-version", "Sec-WebSocket-Version"),
    ("sec-websocket-protocol", "Sec-WebSocket-Protocol"),
    ("sec-websocket-extensions", "Sec-WebSocket-Extensions"),
];

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub uri: http::Uri,
    pub version: HttpVersion,
    pub headers: HeaderList,
    /// Fully buffered, replayable request body.
    pub body: Bytes,
}

impl ProxyRequest {
    /// Host of the inbound request: the Host header when present, the URI
    /// authority otherwise.
    pub fn host(&self) -> Option<String> {
        if let Some(host) = self.headers.get("host") {
            return Some(host.to_string());
        }
        self.uri.authority().map(|authority| authority.to_string())
    }

    pub fn path_and_query(&self) -> String {
        self.uri
            .path_and_query()
            .map(|value| value.to_string())
            .unwrap_or_else(|| "/".to_string())
    }

    /// Serializes the request to HTTP/1.1 wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let target = if self.uri.scheme().is_some() && self.uri.authority().is_some() {
            self.uri.to_string()
        } else {
            self.path_and_query()
        };
        let mut buf = Vec::with_capacity(256 + self.body.len());
        write_request_head(&mut buf, &self.method, &target, &self.headers);
        buf.extend_from_slice(&self.body);
        buf
    }

    pub(crate) fn from_h2_parts(parts: http::request::Parts, body: Bytes) -> Self {
        let mut headers = header_list_from_map(&parts.headers);
        if headers.get("host").is_none() {
            if let Some(authority) = parts.uri.authority() {
                headers.push("host", authority.to_string());
            }
        }
        Self {
            method: parts.method.to_string(),
            uri: parts.uri,
            version: HttpVersion::H2,
            headers,
            body,
        }
    }
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub reason: String,
    pub version: HttpVersion,
    pub headers: HeaderList,
    pub body: ResponseBody,
}

impl ProxyResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            version: HttpVersion::Http11,
            headers: HeaderList::new(),
            body: ResponseBody::empty(),
        }
    }

    /// Plaintext response used for proxy-side failures.
    pub fn plaintext(status: u16, reason: &str, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        let mut response = Self::new(status, reason);
        response.headers.set("Content-Type", "text/plain");
        response
            .headers
            .set("Content-Length", body.len().to_string());
        response.body = ResponseBody::full(body);
        response
    }

    /// Trailer names announced by the `Trailer` header, lowercased.
    pub fn announced_trailer_names(&self) -> Vec<String> {
        self.headers
            .get_all("trailer")
            .flat_map(|value| value.split(','))
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// The complete body, buffering the stream on first use. Subsequent
    /// calls return the same bytes.
    pub async fn raw_body(&mut self) -> ProxyResult<Bytes> {
        self.body.buffer().await
    }

    /// Replaces the body with a replayable view of `bytes`.
    pub fn set_body(&mut self, bytes: impl Into<Bytes>) {
        self.body.set(bytes);
    }

    /// Serializes status line, headers, and the buffered body.
    pub async fn raw(&mut self) -> ProxyResult<Vec<u8>> {
        let body = self.body.buffer().await?;
        let mut buf = Vec::with_capacity(256 + body.len());
        write_response_head(&mut buf, self.version, self.status, &self.reason, &self.headers);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parses `bytes` as an HTTP/1.1 response and supplants the current
    /// one. Everything after the header section becomes the body.
    pub fn set(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        let (head, rest) = split_head(bytes)
            .ok_or_else(|| ProxyError::protocol("response bytes are missing a header section"))?;
        let parsed = parse_response_head(head, "GET")
            .map_err(|error| ProxyError::protocol(error.to_string()))?;
        self.status = parsed.status;
        self.reason = parsed.reason;
        self.version = parsed.version;
        self.headers = parsed.headers;
        self.body = ResponseBody::full(Bytes::copy_from_slice(rest));
        Ok(())
    }
}

/// One inbound request on its way through the proxy.
pub struct Event {
    pub id: u64,
    pub peer: String,
    pub request: ProxyRequest,
    /// Authority pinned by the CONNECT handler; clients send
    /// authority-relative URIs inside tunnels.
    pub force_host: Option<String>,
    pub force_scheme: Option<Scheme>,
    abort: AbortHandle,
    cancel: CancelToken,
}

impl Event {
    pub(crate) fn new(
        id: u64,
        peer: String,
        request: ProxyRequest,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (abort, cancel) = cancel::request_scope(shutdown);
        Self {
            id,
            peer,
            request,
            force_host: None,
            force_scheme: None,
            abort,
            cancel,
        }
    }

    /// Logs a line prefixed with the request id and client address.
    pub fn log(&self, message: impl AsRef<str>) {
        tracing::info!(target: "osmosis::proxy", "[{:>4} {}] {}", self.id, self.peer, message.as_ref());
    }

    /// Logs the message and produces the plaintext 500 sent to the client.
    /// Only meaningful while the response has not been started.
    pub fn send_error(&self, message: impl Into<String>) -> ProxyResponse {
        let message = message.into();
        self.log(&message);
        ProxyResponse::plaintext(500, "Internal Server Error", message.into_bytes())
    }

    /// Serializes the current request, head and buffered body, to HTTP/1.1
    /// wire format. Idempotent; the body is not consumed.
    pub fn raw_request(&self) -> Vec<u8> {
        self.request.to_wire()
    }

    /// The buffered request body.
    pub fn raw_request_body(&self) -> Bytes {
        self.request.body.clone()
    }

    /// Parses `bytes` as an HTTP/1.1 request and supplants the current
    /// one. The request target must be origin-form; the effective scheme
    /// and authority stay governed by the force overrides.
    pub fn set_request(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        let (head, rest) = split_head(bytes)
            .ok_or_else(|| ProxyError::protocol("request bytes are missing a header section"))?;
        let parsed = parse_request_head(head)
            .map_err(|error| ProxyError::protocol(error.to_string()))?;
        if !parsed.target.starts_with('/') && parsed.target != "*" {
            return Err(ProxyError::protocol(
                "request target must be origin-form",
            ));
        }
        let uri = parsed
            .target
            .parse::<http::Uri>()
            .map_err(|error| ProxyError::protocol(format!("request target: {error}")))?;
        self.request.method = parsed.method;
        self.request.uri = uri;
        self.request.version = parsed.version;
        self.request.headers = parsed.headers;
        self.request.body = Bytes::copy_from_slice(rest);
        Ok(())
    }

    /// Replaces the request body with a replayable view of `bytes`. The
    /// Content-Length is recomputed by the next [`Event::prepare_request`].
    pub fn set_request_body(&mut self, bytes: impl Into<Bytes>) {
        self.request.body = bytes.into();
    }

    /// Rewrites the outbound request in place: applies the force
    /// overrides, drops hop-by-hop headers, restores the WebSocket header
    /// spellings, and fixes the body framing headers.
    pub fn prepare_request(&mut self) -> ProxyResult<()> {
        let mut parts = self.request.uri.clone().into_parts();
        if let Some(host) = &self.force_host {
            parts.authority = Some(
                host.parse()
                    .map_err(|error| ProxyError::protocol(format!("force host: {error}")))?,
            );
        }
        if let Some(scheme) = self.force_scheme {
            parts.scheme = Some(
                scheme
                    .as_str()
                    .parse()
                    .expect("static scheme strings always parse"),
            );
        }
        if parts.scheme.is_some() && parts.path_and_query.is_none() {
            parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
        }
        self.request.uri = http::Uri::from_parts(parts)
            .map_err(|error| ProxyError::protocol(format!("request URL: {error}")))?;

        for name in FILTER_HEADERS {
            self.request.headers.remove(name);
        }
        for (name, spelling) in RENAME_HEADERS {
            self.request.headers.rename(name, spelling);
        }

        // The body is already buffered, so 100-continue negotiation has
        // nothing left to defer.
        self.request.headers.remove("expect");
        self.request.headers.remove("transfer-encoding");
        if self.request.body.is_empty() {
            // An empty-but-present body is common on inbound HTTP/2
            // requests; forward it as no body at all.
            if wants_explicit_zero_length(&self.request.method) {
                self.request.headers.set("Content-Length", "0");
            } else {
                self.request.headers.remove("content-length");
            }
        } else {
            self.request
                .headers
                .set("Content-Length", self.request.body.len().to_string());
        }
        Ok(())
    }

    /// Effective scheme after the force override.
    pub fn effective_scheme(&self) -> Scheme {
        if let Some(scheme) = self.force_scheme {
            return scheme;
        }
        match self.request.uri.scheme_str() {
            Some("https") => Scheme::Https,
            _ => Scheme::Http,
        }
    }

    /// Effective authority after the force override.
    pub fn effective_authority(&self) -> ProxyResult<String> {
        if let Some(host) = &self.force_host {
            return Ok(host.clone());
        }
        if let Some(authority) = self.request.uri.authority() {
            return Ok(authority.to_string());
        }
        self.request
            .host()
            .ok_or_else(|| ProxyError::protocol("request has no authority and no Host header"))
    }

    /// One-shot cancellation of this request.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

fn wants_explicit_zero_length(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH")
}

pub(crate) fn header_list_from_map(map: &http::HeaderMap) -> HeaderList {
    let mut list = HeaderList::new();
    for (name, value) in map {
        list.push(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
    }
    list
}

pub(crate) fn header_map_from_list(list: &HeaderList) -> http::HeaderMap {
    let mut map = http::HeaderMap::new();
    for header in list {
        let name = match http::header::HeaderName::from_bytes(header.name.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                tracing::debug!(target: "osmosis::proxy", "dropping invalid header name {:?}", header.name);
                continue;
            }
        };
        let value = match http::header::HeaderValue::from_str(&header.value) {
            Ok(value) => value,
            Err(_) => {
                tracing::debug!(target: "osmosis::proxy", "dropping invalid value for header {:?}", header.name);
                continue;
            }
        };
        map.append(name, value);
    }
    map
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::watch;

    use super::{Event, ProxyRequest, Scheme};
    use crate::http1::{HeaderList, HttpVersion};

    fn test_event(method: &str, target: &str, headers: Vec<(&str, &str)>, body: &[u8]) -> Event {
        let mut list = HeaderList::new();
        for (name, value) in headers {
            list.push(name, value);
        }
        let request = ProxyRequest {
            method: method.to_string(),
            uri: target.parse().expect("test uri"),
            version: HttpVersion::Http11,
            headers: list,
            body: Bytes::copy_from_slice(body),
        };
        let (_tx, rx) = watch::channel(false);
        let mut event = Event::new(1, "127.0.0.1:9".to_string(), request, rx);
        // Keep the shutdown sender alive for the duration of the test.
        std::mem::forget(_tx);
        event.force_host = None;
        event
    }

    #[test]
    fn raw_request_is_idempotent() {
        let event = test_event(
            "POST",
            "http://echo.test/submit",
            vec![("Host", "echo.test"), ("Content-Length", "4")],
            b"ping",
        );
        let first = event.raw_request();
        let second = event.raw_request();
        assert_eq!(first, second);
        assert!(first.ends_with(b"ping"));
        assert_eq!(event.raw_request_body(), Bytes::from_static(b"ping"));
    }

    #[test]
    fn prepare_applies_force_overrides() {
        let mut event = test_event(
            "GET",
            "/status",
            vec![("Host", "echo.test"), ("Proxy-Connection", "keep-alive")],
            b"",
        );
        event.force_host = Some("echo.test:443".to_string());
        event.force_scheme = Some(Scheme::Https);
        event.prepare_request().expect("prepare");

        assert_eq!(event.request.uri.scheme_str(), Some("https"));
        assert_eq!(
            event.request.uri.authority().map(|a| a.as_str()),
            Some("echo.test:443")
        );
        assert!(event.request.headers.get("proxy-connection").is_none());
        assert_eq!(event.request.headers.get("host"), Some("echo.test"));
    }

    #[test]
    fn prepare_restores_websocket_spellings() {
        let mut event = test_event(
            "GET",
            "http://echo.test/socket",
            vec![("sec-websocket-key", "abc"), ("Host", "echo.test")],
            b"",
        );
        event.prepare_request().expect("prepare");
        let spelled = event
            .request
            .headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case("sec-websocket-key"))
            .expect("renamed header");
        assert_eq!(spelled.name, "Sec-WebSocket-Key");
        assert_eq!(spelled.value, "abc");
    }

    #[test]
    fn prepare_updates_content_length_after_body_swap() {
        let mut event = test_event(
            "POST",
            "http://echo.test/submit",
            vec![("Host", "echo.test"), ("Content-Length", "4")],
            b"ping",
        );
        event.set_request_body(Bytes::from_static(b"longer body"));
        event.prepare_request().expect("prepare");
        assert_eq!(event.request.headers.get("content-length"), Some("11"));
    }

    #[test]
    fn set_request_requires_origin_form() {
        let mut event = test_event("GET", "http://echo.test/", vec![("Host", "echo.test")], b"");
        let error = event
            .set_request(b"GET http://evil.test/ HTTP/1.1\r\nHost: evil.test\r\n\r\n")
            .expect_err("absolute form must be rejected");
        assert!(error.to_string().contains("origin-form"));

        event
            .set_request(b"GET /replaced HTTP/1.1\r\nHost: echo.test\r\n\r\nbody")
            .expect("origin form accepted");
        assert_eq!(event.request.uri.path(), "/replaced");
        assert_eq!(event.request.body, Bytes::from_static(b"body"));
    }

    #[test]
    fn abort_cancels_event() {
        let event = test_event("GET", "http://echo.test/", vec![], b"");
        assert!(!event.is_cancelled());
        event.abort();
        assert!(event.is_cancelled());
    }
}
