//! Control commands over the server's own HTTP port, plus handler dispatch
//! through registered zones.

mod common;

use common::*;
use nesta::{
    Handler, HandlerContext, HandlerRegistry, Request, Response, StatusCode,
};
use std::time::Duration;

struct Greeter;

#[async_trait::async_trait]
impl Handler for Greeter {
    async fn handle(&self, req: &Request, resp: &mut Response, ctx: &HandlerContext) -> StatusCode {
        let name = req.query("name").unwrap_or("world");
        let suffix = ctx
            .params()
            .get("greeting.suffix")
            .map(String::as_str)
            .unwrap_or("!");
        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body(format!("hello {name}{suffix}"));
        StatusCode::Ok
    }
}

fn zone_config(name: &str, content: &str, provider: &str) -> nesta::ZoneConfig {
    nesta::ZoneConfig {
        name: name.into(),
        max_session: 0,
        session_timeout: -1,
        apis: vec![nesta::ApiBinding {
            content_name: content.into(),
            provider: provider.into(),
            module: "test".into(),
        }],
        init_apis: Vec::new(),
        term_apis: Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_worker_table() {
    let server = start(test_config(), HandlerRegistry::new()).await;

    let response = roundtrip(
        server.http_addr,
        "POST /?cmd=status HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\n\r\n",
    )
    .await;

    assert_eq!(status_of(&response), 200);
    let body = body_of(&response);
    assert!(body.starts_with("start "));
    assert!(body.contains("[thread info]"));
    assert!(body.contains("----- ------"));
    // 2 base + 2 elastic slots
    assert!(body.contains("\n    4 "));

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn trace_commands_acknowledge() {
    let server = start(test_config(), HandlerRegistry::new()).await;

    let on = roundtrip(
        server.http_addr,
        "POST /?cmd=trace_on HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert_eq!(body_of(&on), "trace mode on.\n");

    let off = roundtrip(
        server.http_addr,
        "POST /?cmd=trace_off HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert_eq!(body_of(&off), "trace mode off.\n");

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_answers_and_unblocks_the_listener() {
    let server = start(test_config(), HandlerRegistry::new()).await;

    // the published client helper is what the CLI uses
    let body = nesta::post_command(server.http_addr.port(), "stop")
        .await
        .unwrap();
    assert_eq!(body, "stopped.\n");

    let served = tokio::time::timeout(Duration::from_secs(2), server.join)
        .await
        .expect("listener must exit after stop")
        .unwrap();
    assert!(served.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_command_is_served_as_request() {
    let server = start(test_config(), HandlerRegistry::new()).await;

    // an extra query parameter disqualifies the command shape; with no
    // document root the empty content name is a 404
    let response = roundtrip(
        server.http_addr,
        "POST /?cmd=stop&extra=1 HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert_eq!(status_of(&response), 404);

    // and the server is still accepting connections
    let again = roundtrip(
        server.http_addr,
        "POST /?cmd=status HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert_eq!(status_of(&again), 200);

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_handler_receives_query_and_user_params() {
    let mut config = test_config();
    config.zones.push(zone_config("app", "greet", "greeter"));
    config
        .user_params
        .insert("greeting.suffix".into(), "!!".into());

    let mut registry = HandlerRegistry::new();
    registry.provide("greeter", Greeter);

    let server = start(config, registry).await;
    let response = roundtrip(
        server.http_addr,
        "GET /greet?name=zone HTTP/1.1\r\nHost: t\r\n\r\n",
    )
    .await;

    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "hello zone!!");

    server.shutdown.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_content_without_root_is_404() {
    let server = start(test_config(), HandlerRegistry::new()).await;

    let response = roundtrip(
        server.http_addr,
        "GET /nothing-here HTTP/1.1\r\nHost: t\r\n\r\n",
    )
    .await;
    assert_eq!(status_of(&response), 404);

    server.shutdown.shutdown();
}
