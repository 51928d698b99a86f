//! Static-file delivery end to end: 200/304/404, escape rejection, HEAD,
//! keep-alive serialization, and access-log lines.

mod common;

use common::*;
use nesta::HandlerRegistry;
use std::{fs, time::Duration};
use tempfile::tempdir;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
};

#[tokio::test(flavor = "multi_thread")]
async fn serves_existing_file_with_length_and_type() {
    let root = tempdir().unwrap();
    fs::write(root.path().join("index.html"), b"hello nesta!\n").unwrap();
    let logs = tempdir().unwrap();
    let log_path = logs.path().join("access.log");

    let mut config = test_config();
    config.document_root = Some(root.path().to_owned());
    config.access_log_fname = Some(log_path.clone());

    let server = start(config, HandlerRegistry::new()).await;
    let response = roundtrip(
        server.http_addr,
        "GET /index.html HTTP/1.1\r\nHost: t\r\nUser-Agent: it\r\n\r\n",
    )
    .await;

    assert_eq!(status_of(&response), 200);
    assert_eq!(header_of(&response, "content-length"), Some("13"));
    assert_eq!(header_of(&response, "content-type"), Some("text/html"));
    assert!(header_of(&response, "last-modified").is_some());
    assert_eq!(body_of(&response), "hello nesta!\n");

    // exactly one access-log line for the request
    tokio::time::sleep(Duration::from_millis(100)).await;
    let log = fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("\"GET /index.html HTTP/1.1\" \"it\" 200 13 "));

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_file_is_404_with_template_body() {
    let root = tempdir().unwrap();
    let mut config = test_config();
    config.document_root = Some(root.path().to_owned());

    let server = start(config, HandlerRegistry::new()).await;
    let response = roundtrip(
        server.http_addr,
        "GET /missing.html HTTP/1.1\r\nHost: t\r\n\r\n",
    )
    .await;

    assert_eq!(status_of(&response), 404);
    assert!(body_of(&response).contains("<h1>404 Not Found</h1>"));

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn parent_escape_is_rejected() {
    let root = tempdir().unwrap();
    fs::write(root.path().join("a.html"), b"x").unwrap();
    let mut config = test_config();
    config.document_root = Some(root.path().to_owned());

    let server = start(config, HandlerRegistry::new()).await;
    for target in ["/../etc/passwd", "/a/../../etc/passwd"] {
        let response = roundtrip(
            server.http_addr,
            &format!("GET {target} HTTP/1.1\r\nHost: t\r\n\r\n"),
        )
        .await;
        assert_eq!(status_of(&response), 404, "target {target}");
    }

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn if_modified_since_match_yields_empty_304() {
    let root = tempdir().unwrap();
    fs::write(root.path().join("a.html"), b"cached content").unwrap();
    let mut config = test_config();
    config.document_root = Some(root.path().to_owned());
    config.file_cache_size = 64; // KiB

    let server = start(config, HandlerRegistry::new()).await;

    let first = roundtrip(server.http_addr, "GET /a.html HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert_eq!(status_of(&first), 200);
    let modified = header_of(&first, "last-modified").unwrap().to_owned();

    let second = roundtrip(
        server.http_addr,
        &format!("GET /a.html HTTP/1.1\r\nHost: t\r\nIf-Modified-Since: {modified}\r\n\r\n"),
    )
    .await;
    assert_eq!(status_of(&second), 304);
    assert_eq!(body_of(&second), "");

    // a second unconditional fetch is served (now from cache) with identical
    // content
    let third = roundtrip(server.http_addr, "GET /a.html HTTP/1.1\r\nHost: t\r\n\r\n").await;
    assert_eq!(status_of(&third), 200);
    assert_eq!(body_of(&third), "cached content");

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn head_gets_headers_only() {
    let root = tempdir().unwrap();
    fs::write(root.path().join("a.html"), b"body").unwrap();
    let mut config = test_config();
    config.document_root = Some(root.path().to_owned());

    let server = start(config, HandlerRegistry::new()).await;
    let response = roundtrip(server.http_addr, "HEAD /a.html HTTP/1.1\r\nHost: t\r\n\r\n").await;

    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "");

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_alive_serves_requests_in_order() {
    let root = tempdir().unwrap();
    fs::write(root.path().join("one.txt"), b"first").unwrap();
    fs::write(root.path().join("two.txt"), b"second").unwrap();
    let mut config = test_config();
    config.document_root = Some(root.path().to_owned());
    config.keep_alive_requests = 5;

    let server = start(config, HandlerRegistry::new()).await;
    let mut stream = TcpStream::connect(server.http_addr).await.unwrap();

    stream
        .write_all(b"GET /one.txt HTTP/1.1\r\nHost: t\r\nConnection: Keep-Alive\r\n\r\n")
        .await
        .unwrap();
    let first = read_one_response(&mut stream).await;
    assert_eq!(status_of(&first), 200);
    assert_eq!(header_of(&first, "connection"), Some("Keep-Alive"));
    assert!(header_of(&first, "keep-alive").unwrap().contains("timeout=1"));
    assert!(first.ends_with("first"));

    // the second response begins only after the first completed
    stream
        .write_all(b"GET /two.txt HTTP/1.1\r\nHost: t\r\nConnection: Keep-Alive\r\n\r\n")
        .await
        .unwrap();
    let second = read_one_response(&mut stream).await;
    assert_eq!(status_of(&second), 200);
    assert!(second.ends_with("second"));

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_keep_alive_budget_disables_reuse() {
    let root = tempdir().unwrap();
    fs::write(root.path().join("a.txt"), b"x").unwrap();
    let mut config = test_config();
    config.document_root = Some(root.path().to_owned());
    config.keep_alive_requests = 0;

    let server = start(config, HandlerRegistry::new()).await;
    let response = roundtrip(
        server.http_addr,
        "GET /a.txt HTTP/1.1\r\nHost: t\r\nConnection: Keep-Alive\r\n\r\n",
    )
    .await;

    assert_eq!(status_of(&response), 200);
    assert_eq!(header_of(&response, "connection"), Some("close"));

    server.shutdown.shutdown();
}
