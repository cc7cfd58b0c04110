//! WebSocket bridging.
//!
//! An upgrade candidate is accepted on the client side, dialed fresh on
//! the upstream side, and the two connections relay discrete messages in
//! both directions until either side closes or errors. Closing one
//! direction closes both.

use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, WebSocketStream};

use crate::event::{header_map_from_list, Event, Scheme};
use crate::http1::{BoxConn, BufferedConn, HeaderList};
use crate::server::ServerShared;

/// Headers owned by the WebSocket handshake itself; the client library
/// reintroduces them with fresh values on the outbound dial.
const HANDSHAKE_HEADERS: [&str; 7] = [
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

/// True when the request asks to upgrade to a WebSocket.
pub(crate) fn is_websocket_upgrade(headers: &HeaderList) -> bool {
    headers.contains_token("upgrade", "websocket")
}

/// Bridges one upgrade request. Owns the client connection from here on.
pub(crate) async fn handle_upgrade(
    ctx: Arc<ServerShared>,
    mut event: Event,
    mut conn: BufferedConn<BoxConn>,
) {
    let upgrade_to = event.request.headers.get("upgrade").unwrap_or("").to_string();
    event.log(format!("handle upgrade request to {upgrade_to}"));

    let client_key = match event.request.headers.get("sec-websocket-key") {
        Some(key) => key.to_string(),
        None => {
            write_plain_error(&mut conn, 400, "missing Sec-WebSocket-Key").await;
            return;
        }
    };

    if let Err(error) = event.prepare_request() {
        event.log(format!("error preparing request: {error}"));
        write_plain_error(&mut conn, 500, "error preparing upgrade request").await;
        return;
    }

    let scheme = event.effective_scheme();
    let authority = match event.effective_authority() {
        Ok(authority) => crate::forward::with_default_port(&authority, scheme),
        Err(error) => {
            write_plain_error(&mut conn, 500, &format!("no upstream host: {error}")).await;
            return;
        }
    };
    let ws_scheme = match scheme {
        Scheme::Http => "ws",
        Scheme::Https => "wss",
    };
    let ws_uri = format!("{ws_scheme}://{authority}{}", event.request.path_and_query());

    let mut outbound_headers = event.request.headers.clone();
    for name in HANDSHAKE_HEADERS {
        outbound_headers.remove(name);
    }
    outbound_headers.remove("content-length");

    let mut builder = http::Request::builder().method("GET").uri(ws_uri.as_str());
    if let Some(map) = builder.headers_mut() {
        *map = header_map_from_list(&outbound_headers);
    }
    let outbound_request = match builder.body(()) {
        Ok(request) => request,
        Err(error) => {
            write_plain_error(&mut conn, 500, &format!("bad upgrade request: {error}")).await;
            return;
        }
    };

    let tcp = match ctx.client.dial(&authority).await {
        Ok(tcp) => tcp,
        Err(error) => {
            event.log(format!("connecting to {authority} failed: {error}"));
            write_plain_error(&mut conn, 502, &format!("connecting to {authority} failed")).await;
            return;
        }
    };
    event.log(format!("connected to {authority}"));

    let connector = match scheme {
        Scheme::Https => Some(Connector::Rustls(ctx.client.websocket_tls_config())),
        Scheme::Http => Some(Connector::Plain),
    };
    let (upstream_ws, upstream_response) =
        match client_async_tls_with_config(outbound_request, tcp, None, connector).await {
            Ok(parts) => parts,
            Err(error) => {
                event.log(format!("websocket dial to {ws_uri} failed: {error}"));
                write_plain_error(&mut conn, 502, "upstream websocket handshake failed").await;
                return;
            }
        };

    // Accept the inbound handshake only after the upstream agreed, so the
    // negotiated subprotocol can be echoed back.
    let accept = derive_accept_key(client_key.as_bytes());
    let mut response_head = String::with_capacity(192);
    response_head.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response_head.push_str("Upgrade: websocket\r\n");
    response_head.push_str("Connection: Upgrade\r\n");
    response_head.push_str(&format!("Sec-WebSocket-Accept: {accept}\r\n"));
    if let Some(protocol) = upstream_response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
    {
        response_head.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    response_head.push_str("\r\n");
    if let Err(error) = conn.stream.write_all(response_head.as_bytes()).await {
        event.log(format!("writing 101 to client failed: {error}"));
        return;
    }

    let client_ws =
        WebSocketStream::from_raw_socket(conn.into_prefixed(), Role::Server, None).await;

    event.log("start forwarding messages");
    let (client_sink, client_stream) = client_ws.split();
    let (upstream_sink, upstream_stream) = upstream_ws.split();

    let mut client_to_upstream = tokio::spawn(relay_messages(client_stream, upstream_sink));
    let mut upstream_to_client = tokio::spawn(relay_messages(upstream_stream, client_sink));

    let mut shutdown = ctx.shutdown.clone();
    tokio::select! {
        _ = &mut client_to_upstream => upstream_to_client.abort(),
        _ = &mut upstream_to_client => client_to_upstream.abort(),
        _ = shutdown.wait_for(|fired| *fired) => {
            // Upgraded connections close immediately on shutdown.
            client_to_upstream.abort();
            upstream_to_client.abort();
        }
    }
    event.log("connection done");
}

/// Copies messages from one side to the other until a close frame, an
/// error, or the end of the stream.
async fn relay_messages<St, Si>(mut source: St, mut sink: Si)
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    Si: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    while let Some(next) = source.next().await {
        let message = match next {
            Ok(message) => message,
            Err(_) => break,
        };
        let is_close = message.is_close();
        if sink.send(message).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn write_plain_error<S>(conn: &mut BufferedConn<S>, status: u16, body: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = write_plain_response(conn, status, body).await;
}

async fn write_plain_response<S>(
    conn: &mut BufferedConn<S>,
    status: u16,
    body: &str,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = crate::http1::default_reason(status);
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    conn.stream.write_all(head.as_bytes()).await
}
