//! End-to-end tests against real loopback TCP servers: spin up a backend,
//! spin up the proxy in front of it, drive both with raw sockets /
//! `tokio-tungstenite`, and assert on what comes back.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_proxy::{ProxyOptions, ProxyServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A backend that records the request line + headers it received and
/// writes back a fixed response.
async fn start_recording_backend(
    response: &'static str,
) -> (SocketAddr, Arc<Mutex<Option<String>>>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(None));
    let captured_clone = captured.clone();
    let handle = tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let request_text = String::from_utf8_lossy(&buf[..n]).to_string();
            *captured_clone.lock().unwrap() = Some(request_text);
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    (addr, captured, handle)
}

async fn raw_get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.shutdown().await.ok();

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response).await;
    let status: u16 = response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    (status, response)
}

#[tokio::test]
async fn get_request_streams_body_and_appends_xfwd_headers() {
    let backend_response = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
    let (backend_addr, captured, _backend_handle) = start_recording_backend(backend_response).await;

    let options = ProxyOptions::new()
        .target(format!("http://{backend_addr}"))
        .xfwd(true);
    let server = Arc::new(ProxyServer::new(options));
    let listen = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let (status, response) = raw_get(listen.local_addr(), "/anything").await;
    assert_eq!(status, 200);
    assert!(response.ends_with("hello"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let request_text = captured.lock().unwrap().clone().expect("backend saw a request");
    assert!(request_text.to_ascii_lowercase().contains("x-forwarded-for"));
    assert!(request_text.to_ascii_lowercase().contains("x-forwarded-proto"));

    listen.close();
}

#[tokio::test]
async fn upstream_connection_refused_surfaces_as_bad_gateway() {
    // Nothing is listening on this port.
    let dead_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let options = ProxyOptions::new().target(format!("http://{dead_addr}"));
    let server = Arc::new(ProxyServer::new(options));
    let listen = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let (status, _response) = raw_get(listen.local_addr(), "/").await;
    assert_eq!(status, 502);

    listen.close();
}

#[tokio::test]
async fn proxy_timeout_surfaces_as_gateway_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 8192];
            let _ = stream.read(&mut buf).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await;
        }
    });

    let mut options = ProxyOptions::new().target(format!("http://{backend_addr}"));
    options.proxy_timeout_ms = Some(20);
    let server = Arc::new(ProxyServer::new(options));
    let listen = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let (status, _response) = raw_get(listen.local_addr(), "/").await;
    assert_eq!(status, 504);

    listen.close();
}

#[tokio::test]
async fn websocket_handshake_splices_frames_both_ways() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = backend_listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                let (mut write, mut read) = futures_util::StreamExt::split(ws);
                while let Some(Ok(msg)) = futures_util::StreamExt::next(&mut read).await {
                    if msg.is_close() {
                        break;
                    }
                    if futures_util::SinkExt::send(&mut write, msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let options = ProxyOptions::new().target(format!("http://{backend_addr}")).ws(true);
    let server = Arc::new(ProxyServer::new(options));
    let listen = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let url = url::Url::parse(&format!("ws://{}/", listen.local_addr())).unwrap();
    let (mut ws, response) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert_eq!(response.status(), 101);

    futures_util::SinkExt::send(&mut ws, tokio_tungstenite::tungstenite::Message::text("ping"))
        .await
        .unwrap();
    let echoed = futures_util::StreamExt::next(&mut ws).await.unwrap().unwrap();
    assert_eq!(echoed.into_text().unwrap(), "ping");

    listen.close();
}

#[tokio::test]
async fn upstream_refusing_the_upgrade_does_not_hang_the_client() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = backend_listener.accept().await {
            let mut buf = vec![0u8; 8192];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        }
    });

    let options = ProxyOptions::new().target(format!("http://{backend_addr}")).ws(true);
    let server = Arc::new(ProxyServer::new(options));
    let listen = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let url = url::Url::parse(&format!("ws://{}/", listen.local_addr())).unwrap();
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected a relayed HTTP response, got {other:?}"),
    }

    listen.close();
}
