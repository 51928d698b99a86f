//! nesta - embeddable HTTP/1.1 application server with clustered sessions
//!
//! The server couples two engines:
//!
//! - a **boss/worker request engine**: a single dispatcher accepts TCP
//!   connections and enqueues them; a pre-spawned worker pool (with bounded
//!   elastic growth under queue pressure) serves them with keep-alive
//!   batching;
//! - a **session relay**: peers replicate per-zone application session state
//!   over a small binary protocol with owner-migration semantics, so a
//!   load-balanced cluster can serve any session from any peer.
//!
//! Around those sit the pieces needed to exercise them: a line-based
//! configuration loader with application *zones*, a registry binding URL
//! content names to application handlers, a validated file cache behind the
//! static-file responder, loopback control commands (`stop` / `status` /
//! `trace_*`), and a rotating access log.
//!
//! # Quick start
//!
//! ```no_run
//! use nesta::{Config, Handler, HandlerContext, HandlerRegistry, Request, Response, Server,
//!     StatusCode};
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl Handler for Hello {
//!     async fn handle(&self, _: &Request, resp: &mut Response, _: &HandlerContext) -> StatusCode {
//!         resp.status(StatusCode::Ok)
//!             .header("Content-Type", "text/html")
//!             .body("<p>hello</p>");
//!         StatusCode::Ok
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("./conf/nesta.conf")?;
//!     let mut registry = HandlerRegistry::new();
//!     registry.provide("hello_handler", Hello);
//!     Server::new(config, registry)?.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! Handlers are wired to URLs by the configuration:
//!
//! ```text
//! http.appzone = demo
//! demo.api = hello, hello_handler, libdemo
//! ```
pub(crate) mod http {
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod queue;
    pub(crate) mod server_impl;
    pub(crate) mod worker;
}
pub(crate) mod session {
    pub(crate) mod proto;
    pub(crate) mod relay;
    pub(crate) mod store;
}
pub(crate) mod access_log;
pub(crate) mod cache;
pub(crate) mod command;
pub(crate) mod config;
pub(crate) mod document;
pub(crate) mod errors;
pub(crate) mod zone;

pub use crate::{
    command::post_command,
    config::{ApiBinding, Config, CopyPeer, HookBinding, RelayConfig, UserParams, ZoneConfig,
        MAX_COPY},
    errors::{ConfigError, RelayError},
    http::{
        request::Request,
        response::Response,
        types::{Method, StatusCode, Version},
    },
    server::server_impl::{BoundServer, Server, ShutdownHandle},
    session::store::{SessionHandle, SessionStore, SESSION_COOKIE},
    zone::{Handler, HandlerContext, HandlerRegistry, Hook, Zone},
};
