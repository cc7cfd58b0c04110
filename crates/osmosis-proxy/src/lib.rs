//! Intercepting HTTP/HTTPS forward proxy.
//!
//! A client configures the proxy as its HTTP proxy. Plaintext requests are
//! observed directly; `CONNECT` tunnels are hijacked, the first byte of the
//! tunnel discriminates TLS from cleartext, and TLS is terminated with
//! certificates minted on demand by the embedded certificate authority.
//! Every request becomes an [`Event`] traversing the operator hook
//! [`Pipeline`], which ends in an upstream round-trip; the response flows
//! back the same way. WebSocket upgrades are bridged end-to-end.

mod body;
mod cancel;
mod cert_cache;
mod config;
mod connect;
mod errors;
mod event;
mod forward;
pub mod hooks;
mod http1;
mod pipeline;
mod server;
mod upgrade;

pub use body::ResponseBody;
pub use cancel::{AbortHandle, CancelToken};
pub use cert_cache::{CertCache, MintedLeaf};
pub use config::{ProxyConfig, UpstreamConfig};
pub use errors::{ProxyError, ProxyResult};
pub use event::{Event, ProxyRequest, ProxyResponse, Scheme};
pub use forward::UpstreamClient;
pub use http1::{
    parse_request_head, parse_response_head, HeaderList, HttpHeader, HttpVersion, RequestHead,
    ResponseHead,
};
pub use pipeline::{FnHook, ForwardAction, Hook, Next, Pipeline};
pub use server::{Proxy, ProxyHandle};

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;
pub(crate) const CHUNK_LINE_LIMIT: usize = 8 * 1024;

/// Hostname reserved for the proxy's built-in endpoints (`GET http://proxy/ca`).
pub(crate) const BUILTIN_HOST: &str = "proxy";
