//! Server construction, the dispatcher (accept) loop, and cooperative
//! shutdown.

use crate::{
    access_log::AccessLog,
    cache::FileCache,
    config::{Config, UserParams},
    errors::ConfigError,
    server::{
        queue::{RequestQueue, Shutdown},
        worker::{run_worker, WorkerTable},
    },
    session::{relay, relay::RelayContext, store::{now_us, SessionStore}},
    zone::{build_zone, Handler, HandlerRegistry, Zone},
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{io::AsyncWriteExt, net::TcpListener};
use tracing::{error, info, warn};

/// Sent to connections accepted while the hand-off queue is saturated; the
/// process keeps running.
const OVERLOAD_RESPONSE: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// A handler bound to a content name, together with its owning zone.
pub(crate) struct Binding {
    pub(crate) zone: Arc<Zone>,
    pub(crate) handler: Arc<dyn Handler>,
}

/// Shared server state. Everything the dispatcher, workers and relay need is
/// reachable from here; there are no process-wide globals.
pub(crate) struct ServerInner {
    pub(crate) config: Config,
    pub(crate) zones: Arc<Vec<Arc<Zone>>>,
    pub(crate) bindings: HashMap<String, Binding>,
    pub(crate) user_params: Arc<UserParams>,
    pub(crate) queue: Arc<RequestQueue>,
    pub(crate) relay_queue: Option<Arc<RequestQueue>>,
    pub(crate) workers: WorkerTable,
    pub(crate) cache: Option<FileCache>,
    pub(crate) access_log: AccessLog,
    pub(crate) shutdown: Arc<Shutdown>,
    pub(crate) relay: Option<Arc<RelayContext>>,
    pub(crate) start_time_us: i64,
    trace: AtomicBool,
}

impl ServerInner {
    #[inline]
    pub(crate) fn trace_enabled(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    pub(crate) fn set_trace(&self, on: bool) {
        self.trace.store(on, Ordering::Relaxed);
    }
}

/// Handle for requesting shutdown from outside the server (signal handlers,
/// embedding applications).
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<Shutdown>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }
}

/// The application server: a boss/worker HTTP engine plus, when configured,
/// the session-relay peer listener.
///
/// ```no_run
/// use nesta::{Config, HandlerRegistry, Server};
///
/// # async fn run() -> anyhow::Result<()> {
/// let config = Config::load("./conf/nesta.conf")?;
/// let registry = HandlerRegistry::new();
/// Server::new(config, registry)?.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Builds the server: resolves handler bindings against the registry,
    /// creates zones with their session stores, and sizes the worker table.
    pub fn new(config: Config, registry: HandlerRegistry) -> Result<Server, ConfigError> {
        let relay_ctx = config.relay.as_ref().map(|rc| {
            // never copy to ourselves
            let copy_peers = rc
                .copy_peers
                .iter()
                .filter(|p| !(p.host.eq_ignore_ascii_case(&rc.host) && p.port == rc.port))
                .cloned()
                .collect();
            Arc::new(RelayContext {
                host: rc.host.clone(),
                port: rc.port,
                copy_peers,
                check_interval: rc.check_interval,
            })
        });

        let mut zones = Vec::with_capacity(config.zones.len());
        let mut bindings = HashMap::new();
        for zone_config in &config.zones {
            let sessions = (zone_config.max_session != 0).then(|| {
                SessionStore::new(
                    &zone_config.name,
                    zone_config.max_session,
                    zone_config.session_timeout,
                    relay_ctx.clone(),
                )
            });
            let zone = Arc::new(build_zone(zone_config, &registry, sessions)?);

            for api in &zone_config.apis {
                let handler = registry.handler(&api.provider).ok_or_else(|| {
                    ConfigError::UnknownProvider {
                        provider: api.provider.clone(),
                        module: api.module.clone(),
                    }
                })?;
                // first binding of a content name wins
                bindings
                    .entry(api.content_name.clone())
                    .or_insert_with(|| Binding {
                        zone: zone.clone(),
                        handler,
                    });
            }
            zones.push(zone);
        }

        let cache = (config.file_cache_size > 0).then(|| FileCache::new(config.file_cache_size));
        let access_log = match &config.access_log_fname {
            Some(path) => AccessLog::open(path, config.daily_log_flag),
            None => AccessLog::disabled(),
        };
        let workers = WorkerTable::new(config.worker_threads, config.max_worker_threads());
        let relay_queue = relay_ctx.as_ref().map(|_| Arc::new(RequestQueue::new()));
        let trace = AtomicBool::new(config.trace_flag);
        let user_params = Arc::new(config.user_params.clone());

        Ok(Server {
            inner: Arc::new(ServerInner {
                config,
                zones: Arc::new(zones),
                bindings,
                user_params,
                queue: Arc::new(RequestQueue::new()),
                relay_queue,
                workers,
                cache,
                access_log,
                shutdown: Arc::new(Shutdown::new()),
                relay: relay_ctx,
                start_time_us: now_us(),
                trace,
            }),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.inner.shutdown.clone(),
        }
    }

    /// Binds the HTTP listener (and the relay listener when configured)
    /// without serving yet.
    pub async fn bind(self) -> io::Result<BoundServer> {
        let http_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.inner.config.port_no));
        let http = listen(http_addr, self.inner.config.backlog)?;

        let relay_listener = match (&self.inner.config.relay, &self.inner.relay) {
            (Some(rc), Some(_)) => {
                let addr = resolve(&rc.host, rc.port)?;
                Some(listen(addr, rc.backlog)?)
            }
            _ => None,
        };

        Ok(BoundServer {
            inner: self.inner,
            http,
            relay_listener,
        })
    }

    /// Binds and serves until `stop` (or a [`ShutdownHandle`]) fires.
    pub async fn run(self) -> io::Result<()> {
        self.bind().await?.serve().await
    }
}

/// A server with its listening sockets bound; `serve` starts the engine.
pub struct BoundServer {
    inner: Arc<ServerInner>,
    http: TcpListener,
    relay_listener: Option<TcpListener>,
}

impl BoundServer {
    pub fn http_addr(&self) -> io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.inner.shutdown.clone(),
        }
    }

    /// Runs init hooks, spawns the worker pool and the relay engine, then
    /// dispatches accepted connections until shutdown. Term hooks run before
    /// returning.
    pub async fn serve(self) -> io::Result<()> {
        let inner = self.inner;
        // the hand-off queue is bounded by the listener backlog
        let pending_cap = inner.config.backlog.max(1) as usize;

        for zone in inner.zones.iter() {
            for hook in &zone.init_hooks {
                hook.call(&inner.user_params)?;
            }
        }

        if inner.trace_enabled() {
            info!(
                port = inner.config.port_no,
                workers = inner.config.worker_threads,
                max_workers = inner.config.max_worker_threads(),
                "http listening"
            );
        }

        for index in 0..inner.config.worker_threads {
            inner.workers.reserve_base(index);
            tokio::spawn(run_worker(inner.clone(), index, false));
        }

        for zone in inner.zones.iter() {
            if let Some(store) = zone.sessions() {
                store.spawn_reaper(inner.shutdown.clone());
            }
        }

        if let (Some(ctx), Some(listener), Some(queue), Some(rc)) = (
            inner.relay.clone(),
            self.relay_listener,
            inner.relay_queue.clone(),
            inner.config.relay.clone(),
        ) {
            if inner.trace_enabled() {
                info!(
                    host = %ctx.host,
                    port = ctx.port,
                    workers = rc.worker_threads,
                    "session relay listening"
                );
                for peer in &ctx.copy_peers {
                    info!(host = %peer.host, port = peer.port, "session copy peer");
                }
            }
            for _ in 0..rc.worker_threads {
                tokio::spawn(relay::relay_worker(
                    queue.clone(),
                    inner.zones.clone(),
                    ctx.clone(),
                    inner.shutdown.clone(),
                ));
            }
            tokio::spawn(relay_accept(listener, queue, inner.shutdown.clone()));
            tokio::spawn(relay::health_check(ctx, inner.shutdown.clone()));
        }

        loop {
            tokio::select! {
                _ = inner.shutdown.wait() => break,
                accepted = self.http.accept() => match accepted {
                    Ok((mut stream, peer)) => {
                        if inner.queue.len() >= pending_cap {
                            warn!(%peer, "request queue full, rejecting connection");
                            tokio::spawn(async move {
                                let _ = stream.write_all(OVERLOAD_RESPONSE).await;
                            });
                            continue;
                        }
                        inner.queue.push((stream, peer));
                        // elasticity rule: queued work plus spare capacity
                        // grows the pool
                        if !inner.queue.is_empty() {
                            if let Some(slot) = inner.workers.try_reserve_extended() {
                                if inner.trace_enabled() {
                                    info!(slot, queued = inner.queue.len(), "extending worker pool");
                                }
                                tokio::spawn(run_worker(inner.clone(), slot, true));
                            }
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "accept failed");
                    }
                },
            }
        }

        for zone in inner.zones.iter() {
            for hook in &zone.term_hooks {
                if let Err(err) = hook.call(&inner.user_params) {
                    warn!(zone = zone.name(), error = %err, "term hook failed");
                }
            }
        }
        if inner.trace_enabled() {
            info!("server stopped");
        }
        Ok(())
    }
}

async fn relay_accept(
    listener: TcpListener,
    queue: Arc<RequestQueue>,
    shutdown: Arc<Shutdown>,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => queue.push((stream, peer)),
                Err(err) => error!(error = %err, "relay accept failed"),
            },
        }
    }
}

/// Binds a listener with the configured backlog.
fn listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}")))
}
