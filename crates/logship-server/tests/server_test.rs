//! Integration tests for the server lifecycle.
//!
//! Covers multi-address binding with partial failures, in-flight draining
//! during shutdown, the 503 gate on surviving keep-alive connections, the
//! request counter, and the shutdown timeout path.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{routing::get, Router};
use logship_server::{Server, ServerError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

fn test_router(sleep: Duration) -> Router {
    Router::new()
        .route("/ok", get(|| async { "ok" }))
        .route(
            "/slow",
            get(move || async move {
                tokio::time::sleep(sleep).await;
                "done"
            }),
        )
}

async fn start_server(server: Arc<Server>) -> SocketAddr {
    let serve = server.init(|addr, err| panic!("bind {addr} failed: {err}")).await.unwrap();
    tokio::spawn(serve);
    server.local_addrs()[0]
}

/// Sends one HTTP/1.1 request on an already-open connection and reads the
/// full response, honoring `content-length` so keep-alive connections can be
/// reused.
async fn raw_request(stream: &mut TcpStream, path: &str) -> String {
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if response_complete(&buf) {
            break;
        }
        match tokio::time::timeout(Duration::from_secs(3), stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn response_complete(buf: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(buf) else { return false };
    let Some((head, body)) = text.split_once("\r\n\r\n") else { return false };
    let content_length = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
    });
    match content_length {
        Some(len) => body.len() >= len,
        None => false,
    }
}

#[tokio::test]
async fn serves_on_every_bound_address() {
    let server = Arc::new(
        Server::new(vec!["127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap()])
            .use_handler(test_router(Duration::ZERO)),
    );
    let serve = server.init(|addr, err| panic!("bind {addr} failed: {err}")).await.unwrap();
    tokio::spawn(serve);

    let addrs = server.local_addrs();
    assert_eq!(addrs.len(), 2);

    for addr in addrs {
        let response = reqwest::get(format!("http://{addr}/ok")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn reports_unbindable_addresses_and_continues() {
    // Hold a listener so one of the two addresses cannot be bound.
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let occupied_addr = occupied.local_addr().unwrap();

    let server = Server::new(vec![occupied_addr, "127.0.0.1:0".parse().unwrap()])
        .use_handler(test_router(Duration::ZERO));

    let reported = Arc::new(AtomicUsize::new(0));
    let serve = {
        let reported = Arc::clone(&reported);
        server
            .init(move |addr, _err| {
                assert_eq!(addr, occupied_addr);
                reported.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap()
    };
    tokio::spawn(serve);

    assert_eq!(reported.load(Ordering::SeqCst), 1);
    assert_eq!(server.local_addrs().len(), 1);

    let addr = server.local_addrs()[0];
    let response = reqwest::get(format!("http://{addr}/ok")).await.unwrap();
    assert_eq!(response.status(), 200);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn init_fails_when_nothing_binds() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let occupied_addr = occupied.local_addr().unwrap();

    let server = Server::new(vec![occupied_addr]);
    let mut reported = 0;
    let result = server.init(|_, _| reported += 1).await;

    assert_eq!(reported, 1);
    assert!(matches!(result.err(), Some(ServerError::NoInterface)));
}

#[tokio::test]
async fn shutdown_drains_in_flight_requests() {
    let server = Arc::new(
        Server::new(vec!["127.0.0.1:0".parse().unwrap()])
            .use_handler(test_router(Duration::from_millis(300)))
            .use_shutdown_timeout(Duration::from_secs(2)),
    );
    let addr = start_server(Arc::clone(&server)).await;

    let in_flight = tokio::spawn(async move {
        reqwest::get(format!("http://{addr}/slow")).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    server.shutdown().await.expect("in-flight request finishes within the window");
    assert!(started.elapsed() >= Duration::from_millis(150), "shutdown waited for the drain");

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "done");

    // New connections are refused once the listeners are gone.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn keep_alive_requests_get_503_during_shutdown() {
    let server = Arc::new(
        Server::new(vec!["127.0.0.1:0".parse().unwrap()])
            .use_handler(test_router(Duration::from_millis(500)))
            .use_shutdown_timeout(Duration::from_secs(3)),
    );
    let addr = start_server(Arc::clone(&server)).await;

    // Establish a keep-alive connection before shutdown begins.
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let first = raw_request(&mut conn, "/ok").await;
    assert!(first.starts_with("HTTP/1.1 200"), "unexpected response: {first}");

    // An in-flight slow request keeps the server draining while we probe.
    let slow = tokio::spawn(async move { reqwest::get(format!("http://{addr}/slow")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let shutdown = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The established connection survives the listener close; the gate must
    // turn it away.
    let second = raw_request(&mut conn, "/ok").await;
    assert!(second.starts_with("HTTP/1.1 503"), "unexpected response: {second}");
    assert!(second.to_ascii_lowercase().contains("connection: close"));
    assert!(second.contains("server closed"));

    assert!(shutdown.await.unwrap().is_ok());
    assert_eq!(slow.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn request_count_tracks_in_flight_handlers() {
    let server = Arc::new(
        Server::new(vec!["127.0.0.1:0".parse().unwrap()])
            .use_handler(test_router(Duration::from_millis(400))),
    );
    let addr = start_server(Arc::clone(&server)).await;

    assert_eq!(server.request_count(), 0);

    let mut requests = Vec::new();
    for _ in 0..5 {
        requests.push(tokio::spawn(async move {
            reqwest::get(format!("http://{addr}/slow")).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.request_count(), 5);

    for request in requests {
        assert_eq!(request.await.unwrap().unwrap().status(), 200);
    }

    // Quiescent again once every handler returned.
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.request_count() != 0 {
        assert!(Instant::now() < deadline, "request count should drain to zero");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_times_out_on_stuck_requests() {
    let server = Arc::new(
        Server::new(vec!["127.0.0.1:0".parse().unwrap()])
            .use_handler(test_router(Duration::from_secs(5)))
            .use_shutdown_timeout(Duration::from_millis(300)),
    );
    let addr = start_server(Arc::clone(&server)).await;

    let _stuck = tokio::spawn(async move { reqwest::get(format!("http://{addr}/slow")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let err = server.shutdown().await.unwrap_err();
    assert!(err.is_shutdown_timeout(), "expected timeout, got: {err}");
    assert!(started.elapsed() < Duration::from_secs(2), "deadline must be enforced");
}

#[tokio::test]
async fn second_shutdown_reports_closed() {
    let server = Arc::new(
        Server::new(vec!["127.0.0.1:0".parse().unwrap()])
            .use_handler(test_router(Duration::ZERO)),
    );
    start_server(Arc::clone(&server)).await;

    server.shutdown().await.unwrap();
    assert!(matches!(server.shutdown().await, Err(ServerError::Closed)));
}
