use std::time::Duration;

use futures::{SinkExt, StreamExt};
use osmosis_proxy::{Proxy, ProxyConfig, ProxyHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

async fn start_proxy() -> ProxyHandle {
    let ca = osmosis_certauth::CertificateAuthority::generate().expect("generate ca");
    let mut config = ProxyConfig::default();
    config.bind = "127.0.0.1:0".parse().expect("bind addr");
    let proxy = Proxy::new(config, ca).expect("build proxy");
    proxy.start().await.expect("start proxy")
}

/// WebSocket server that echoes every message until the client closes.
async fn start_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo server");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(mut websocket) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = websocket.next().await {
                    if message.is_close() {
                        break;
                    }
                    if websocket.send(message).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

async fn open_tunnel(proxy_addr: std::net::SocketAddr, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy_addr).await.expect("dial proxy");
    let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.expect("send CONNECT");

    let mut data = Vec::new();
    let mut byte = [0_u8; 1];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read CONNECT response");
        assert_ne!(read, 0, "proxy closed during CONNECT");
        data.push(byte[0]);
    }
    assert!(
        data.starts_with(b"HTTP/1.0 200 OK"),
        "{}",
        String::from_utf8_lossy(&data)
    );
    stream
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn websocket_echo_through_the_proxy() {
    let echo_addr = start_echo_server().await;
    let proxy = start_proxy().await;

    let tunnel = open_tunnel(proxy.local_addr(), &echo_addr.to_string()).await;
    let (mut websocket, _response) =
        tokio_tungstenite::client_async(format!("ws://{echo_addr}/"), tunnel)
            .await
            .expect("websocket handshake through proxy");

    websocket
        .send(Message::Text("foobar".into()))
        .await
        .expect("send text frame");
    let echoed = websocket
        .next()
        .await
        .expect("echo frame")
        .expect("echo frame ok");
    assert_eq!(echoed, Message::Text("foobar".into()));

    websocket
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await
        .expect("send close");

    // The relay propagates the close; the stream ends shortly after.
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(next) = websocket.next().await {
            if next.map(|message| message.is_close()).unwrap_or(true) {
                break;
            }
        }
    })
    .await;
    assert!(deadline.is_ok(), "close was not propagated in time");

    proxy.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn binary_frames_survive_the_relay() {
    let echo_addr = start_echo_server().await;
    let proxy = start_proxy().await;

    let tunnel = open_tunnel(proxy.local_addr(), &echo_addr.to_string()).await;
    let (mut websocket, _response) =
        tokio_tungstenite::client_async(format!("ws://{echo_addr}/"), tunnel)
            .await
            .expect("websocket handshake through proxy");

    let payload = vec![0_u8, 1, 2, 3, 0xff, 0x16];
    websocket
        .send(Message::Binary(payload.clone()))
        .await
        .expect("send binary frame");
    let echoed = websocket
        .next()
        .await
        .expect("echo frame")
        .expect("echo frame ok");
    assert_eq!(echoed, Message::Binary(payload));

    proxy.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}
