//! Shared scaffolding for the end-to-end tests: server startup on ephemeral
//! ports, a minimal raw HTTP client, and relay wire-frame builders that speak
//! the binary protocol independently of the server's own codec.

#![allow(dead_code)]

use nesta::{Config, HandlerRegistry, Server, ShutdownHandle};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};

pub struct TestServer {
    pub http_addr: SocketAddr,
    pub relay_addr: Option<SocketAddr>,
    pub shutdown: ShutdownHandle,
    pub join: JoinHandle<std::io::Result<()>>,
}

/// Binds and serves `config` on ephemeral ports.
pub async fn start(config: Config, registry: HandlerRegistry) -> TestServer {
    let bound = Server::new(config, registry)
        .expect("server construction")
        .bind()
        .await
        .expect("bind");
    // the listener binds the wildcard address; dial loopback explicitly
    let mut http_addr = bound.http_addr().expect("http addr");
    http_addr.set_ip("127.0.0.1".parse().unwrap());
    let relay_addr = bound.relay_addr();
    let shutdown = bound.shutdown_handle();
    let join = tokio::spawn(bound.serve());
    // let the worker pool come up
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        http_addr,
        relay_addr,
        shutdown,
        join,
    }
}

/// One HTTP exchange over a fresh connection; returns the raw response.
pub async fn roundtrip(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");
    String::from_utf8_lossy(&raw).into_owned()
}

pub fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line")
}

pub fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

pub fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split_once("\r\n\r\n").map(|(h, _)| h)?;
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

/// Reads exactly one response (headers + `Content-Length` body) from a
/// keep-alive connection.
pub async fn read_one_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        let mut chunk = [0u8; 2048];
        let n = stream.read(&mut chunk).await.expect("read");
        assert!(n > 0, "connection closed before full response");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.eq_ignore_ascii_case("content-length")
                .then(|| v.trim().parse().ok())?
        })
        .unwrap_or(0);

    let total = head_end + 4 + content_length;
    while buf.len() < total {
        let mut chunk = [0u8; 2048];
        let n = stream.read(&mut chunk).await.expect("read body");
        assert!(n > 0, "connection closed inside body");
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf[..total]).into_owned()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Reserves an ephemeral port. The listener is dropped before returning, so
/// the port stays free for the server to claim.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
    listener.local_addr().expect("local addr").port()
}

/// Base config for tests: one base worker pair, short keep-alive, no log.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.port_no = 0;
    config.worker_threads = 2;
    config.extend_worker_threads = 2;
    config.keep_alive_timeout = 1;
    config.user_params = HashMap::new();
    config
}

// Relay wire frames, written out by hand so the tests exercise the protocol
// contract rather than the server's own encoder.

pub fn wire_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

pub fn wire_copy_set(out: &mut Vec<u8>, peers: &[(&str, u16)]) {
    out.extend_from_slice(&(peers.len() as u16).to_be_bytes());
    for (host, port) in peers {
        wire_string(out, host);
        out.extend_from_slice(&port.to_be_bytes());
    }
}

pub fn wire_entries(out: &mut Vec<u8>, entries: &[(&str, &[u8])]) {
    out.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for (key, value) in entries {
        wire_string(out, key);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
    }
}

/// Sends one relay command frame and reads the complete reply.
pub async fn relay_call(addr: SocketAddr, frame: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("relay connect");
    stream.write_all(frame).await.expect("relay write");
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.expect("relay read");
    reply
}
