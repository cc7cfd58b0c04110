use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use osmosis_proxy::{
    Event, Hook, Next, Proxy, ProxyConfig, ProxyHandle, ProxyResponse, ProxyResult,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_proxy(configure: impl FnOnce(&mut Proxy)) -> ProxyHandle {
    let ca = osmosis_certauth::CertificateAuthority::generate().expect("generate ca");
    let mut config = ProxyConfig::default();
    config.bind = "127.0.0.1:0".parse().expect("bind addr");
    let mut proxy = Proxy::new(config, ca).expect("build proxy");
    configure(&mut proxy);
    proxy.start().await.expect("start proxy")
}

/// Serves canned HTTP/1.1 exchanges: for every request head it records
/// the head and writes `response`, until the client goes away.
async fn start_upstream(
    response: &'static str,
) -> (std::net::SocketAddr, Arc<std::sync::Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_writer = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let seen = Arc::clone(&seen_writer);
            tokio::spawn(async move {
                loop {
                    let head = match read_head(&mut stream).await {
                        Some(head) => head,
                        None => break,
                    };
                    seen.lock().expect("seen lock").push(head);
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, seen)
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut data = Vec::new();
    let mut byte = [0_u8; 1];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => data.push(byte[0]),
        }
    }
    Some(String::from_utf8_lossy(&data).to_string())
}

async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buffer = [0_u8; 1024];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => data.extend_from_slice(&buffer[..read]),
        }
    }
    data
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwards_request_stripping_hop_headers_and_preserving_trailers() {
    let (upstream_addr, seen) = start_upstream(
        "HTTP/1.1 200 OK\r\nTrailer: X-Hash\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nfoobar\r\n0\r\nX-Hash: abc\r\n\r\n",
    )
    .await;
    let proxy = start_proxy(|_| {}).await;

    let mut client = TcpStream::connect(proxy.local_addr()).await.expect("dial proxy");
    let request = format!(
        "GET http://{upstream_addr}/x HTTP/1.1\r\nHost: {upstream_addr}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let raw = read_until_closed(&mut client).await;
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("Trailer: X-Hash"), "{text}");
    assert!(text.contains("foobar"), "{text}");
    assert!(text.contains("X-Hash: abc"), "{text}");

    let seen = seen.lock().expect("seen lock");
    assert_eq!(seen.len(), 1);
    let upstream_head = &seen[0];
    assert!(upstream_head.starts_with("GET /x HTTP/1.1\r\n"), "{upstream_head}");
    assert!(
        !upstream_head.to_ascii_lowercase().contains("proxy-connection"),
        "hop header leaked upstream: {upstream_head}"
    );

    proxy.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

struct CountingHook {
    hits: Arc<AtomicUsize>,
}

impl Hook for CountingHook {
    fn handle<'a>(
        &'a self,
        event: &'a mut Event,
        next: Next<'a>,
    ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
        Box::pin(async move {
            self.hits.fetch_add(1, Ordering::SeqCst);
            next.run(event).await
        })
    }
}

struct SetAgentHook;

impl Hook for SetAgentHook {
    fn handle<'a>(
        &'a self,
        event: &'a mut Event,
        next: Next<'a>,
    ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
        Box::pin(async move {
            event.request.headers.set("User-Agent", "P");
            next.run(event).await
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hooks_run_once_per_request_and_mutations_reach_upstream() {
    let (upstream_addr, seen) =
        start_upstream("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_hook = Arc::clone(&hits);
    let proxy = start_proxy(move |proxy| {
        proxy.register(CountingHook { hits: hits_hook });
        proxy.register(SetAgentHook);
    })
    .await;

    let mut client = TcpStream::connect(proxy.local_addr()).await.expect("dial proxy");
    let request = format!(
        "GET http://{upstream_addr}/agent HTTP/1.1\r\nHost: {upstream_addr}\r\nUser-Agent: original\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");
    let raw = read_until_closed(&mut client).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("ok"), "{text}");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let seen = seen.lock().expect("seen lock");
    assert!(seen[0].contains("User-Agent: P\r\n"), "{}", seen[0]);

    proxy.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

struct BlockHook;

impl Hook for BlockHook {
    fn handle<'a>(
        &'a self,
        _event: &'a mut Event,
        _next: Next<'a>,
    ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
        Box::pin(async move { Ok(ProxyResponse::plaintext(403, "Forbidden", "blocked\n")) })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_circuiting_hook_never_contacts_upstream() {
    let (upstream_addr, seen) =
        start_upstream("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let proxy = start_proxy(|proxy| proxy.register(BlockHook)).await;

    let mut client = TcpStream::connect(proxy.local_addr()).await.expect("dial proxy");
    let request = format!(
        "GET http://{upstream_addr}/blocked HTTP/1.1\r\nHost: {upstream_addr}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");
    let raw = read_until_closed(&mut client).await;
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{text}");
    assert!(text.ends_with("blocked\n"), "{text}");
    assert!(seen.lock().expect("seen lock").is_empty());

    proxy.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn builtin_endpoint_serves_ca_certificate() {
    let proxy = start_proxy(|_| {}).await;

    let mut client = TcpStream::connect(proxy.local_addr()).await.expect("dial proxy");
    client
        .write_all(b"GET http://proxy/ca HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n")
        .await
        .expect("send request");
    let raw = read_until_closed(&mut client).await;
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(
        text.contains("Content-Type: application/x-x509-ca-cert"),
        "{text}"
    );
    assert!(
        text.contains("Cache-Control: no-cache, no-store, must-revalidate"),
        "{text}"
    );
    assert!(text.contains("-----BEGIN CERTIFICATE-----"), "{text}");

    proxy.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_builtin_path_is_not_found() {
    let proxy = start_proxy(|_| {}).await;

    let mut client = TcpStream::connect(proxy.local_addr()).await.expect("dial proxy");
    client
        .write_all(b"GET http://proxy/other HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n")
        .await
        .expect("send request");
    let raw = read_until_closed(&mut client).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{text}");

    proxy.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}
