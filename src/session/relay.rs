//! Session relay: cluster peer server and client.
//!
//! The relay listener feeds a dedicated queue drained by its own worker
//! pool; each accepted connection carries exactly one command. The client
//! side is invoked by the session stores (ownership hand-over, timestamp
//! queries) and by the copy distributor after local mutations. Any peer-call
//! failure is logged and the caller proceeds with local state; there are no
//! retries at this layer.

use crate::{
    config::CopyPeer,
    errors::RelayError,
    server::queue::{RequestQueue, Shutdown},
    session::{
        proto::{self, Command, HELLO_OK, MAX_HOSTNAME, MAX_SESSION_ID, MAX_ZONENAME,
            SESSION_KEY_SIZE},
        store::{SessionSnapshot, SessionStore},
    },
    zone::Zone,
};
use bytes::{BufMut, BytesMut};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// This peer's relay identity: its advertised endpoint and the copy-set it
/// replicates to (already stripped of the peer's own address).
pub(crate) struct RelayContext {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) copy_peers: Vec<CopyPeer>,
    pub(crate) check_interval: u64,
}

/// Hostnames travel as ASCII on the wire for interop; they are resolved to
/// numeric addresses once on receipt so later client calls skip DNS.
async fn canonical_host(host: String, port: u16) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    let lookup = tokio::net::lookup_host((host.clone(), port)).await;
    match lookup {
        Ok(mut addrs) => addrs
            .next()
            .map(|addr| addr.ip().to_string())
            .unwrap_or(host),
        Err(_) => host,
    }
}

fn find_store<'a>(zones: &'a [Arc<Zone>], name: &str) -> Result<&'a SessionStore, RelayError> {
    zones
        .iter()
        .find(|z| z.name() == name)
        .and_then(|z| z.sessions())
        .ok_or_else(|| RelayError::UnknownZone(name.to_owned()))
}

// Server side

/// Relay worker loop: one command per popped connection.
pub(crate) async fn relay_worker(
    queue: Arc<RequestQueue>,
    zones: Arc<Vec<Arc<Zone>>>,
    ctx: Arc<RelayContext>,
    shutdown: Arc<Shutdown>,
) {
    loop {
        let (mut stream, peer) = tokio::select! {
            _ = shutdown.wait() => break,
            item = queue.pop() => item,
        };
        if shutdown.is_set() {
            break;
        }
        if let Err(err) = serve_connection(&mut stream, &zones, &ctx).await {
            warn!(%peer, error = %err, "session relay command failed");
        }
    }
}

async fn serve_connection(
    stream: &mut TcpStream,
    zones: &[Arc<Zone>],
    ctx: &RelayContext,
) -> Result<(), RelayError> {
    match proto::read_command(stream).await? {
        Command::Hello => {
            stream.write_all(HELLO_OK).await?;
            Ok(())
        }
        Command::RequestSession => handle_request_session(stream, zones, ctx).await,
        Command::ChangeOwner => handle_change_owner(stream, zones).await,
        Command::QueryTimestamp => handle_query_timestamp(stream, zones).await,
        Command::DeleteSession => handle_delete_session(stream, zones).await,
        Command::CopySession => handle_copy_session(stream, zones).await,
    }
}

/// `RS`: hand the session to the requesting peer. A non-owner first chases
/// the hinted owner so the reply carries the freshest state.
async fn handle_request_session(
    stream: &mut TcpStream,
    zones: &[Arc<Zone>],
    ctx: &RelayContext,
) -> Result<(), RelayError> {
    let zone_name = proto::read_string(stream, MAX_ZONENAME).await?;
    let key = proto::read_string(stream, SESSION_KEY_SIZE).await?;
    let new_host = proto::read_string(stream, MAX_HOSTNAME).await?;
    let new_port = stream.read_u16().await?;
    if new_port == 0 {
        return Err(RelayError::Protocol("new owner port is zero"));
    }
    let new_host = canonical_host(new_host, new_port).await;
    let copies = proto::read_copy_set(stream).await?;

    let store = find_store(zones, &zone_name)?;

    if let Ok((_, Some((owner_host, owner_port)))) = store.timestamp(&key) {
        match request_session(
            &owner_host,
            owner_port,
            &zone_name,
            &key,
            &ctx.host,
            ctx.port,
            &ctx.copy_peers,
        )
        .await
        {
            Ok(fetched) => store.adopt(&key, fetched.last_update, fetched.entries),
            Err(err) => warn!(
                zone = %zone_name,
                owner = %owner_host,
                error = %err,
                "chained session fetch failed, replying with local state"
            ),
        }
    }

    let (last_update, entries) = store.transfer_ownership(&key, (new_host, new_port), copies)?;

    let mut reply = BytesMut::new();
    reply.put_i64(last_update);
    proto::put_entries(&mut reply, &entries);
    stream.write_all(&reply).await?;
    Ok(())
}

async fn handle_change_owner(
    stream: &mut TcpStream,
    zones: &[Arc<Zone>],
) -> Result<(), RelayError> {
    let zone_name = proto::read_string(stream, MAX_ZONENAME).await?;
    let key = proto::read_string(stream, SESSION_KEY_SIZE).await?;
    let host = proto::read_string(stream, MAX_HOSTNAME).await?;
    let port = stream.read_u16().await?;
    if port == 0 {
        return Err(RelayError::Protocol("owner port is zero"));
    }
    let host = canonical_host(host, port).await;
    let copies = proto::read_copy_set(stream).await?;

    find_store(zones, &zone_name)?.set_owner_hint(&key, (host, port), copies)
}

async fn handle_query_timestamp(
    stream: &mut TcpStream,
    zones: &[Arc<Zone>],
) -> Result<(), RelayError> {
    let zone_name = proto::read_string(stream, MAX_ZONENAME).await?;
    let key = proto::read_string(stream, SESSION_KEY_SIZE).await?;

    let store = find_store(zones, &zone_name)?;
    let (mut ts, hint) = store.timestamp(&key)?;
    if let Some((owner_host, owner_port)) = hint {
        match query_timestamp(&owner_host, owner_port, &zone_name, &key).await {
            Ok(owner_ts) => ts = owner_ts,
            Err(err) => warn!(
                zone = %zone_name,
                owner = %owner_host,
                error = %err,
                "owner timestamp query failed, replying with local value"
            ),
        }
    }

    stream.write_all(&ts.to_be_bytes()).await?;
    Ok(())
}

async fn handle_delete_session(
    stream: &mut TcpStream,
    zones: &[Arc<Zone>],
) -> Result<(), RelayError> {
    let zone_name = proto::read_string(stream, MAX_ZONENAME).await?;
    let key = proto::read_string(stream, SESSION_KEY_SIZE).await?;
    find_store(zones, &zone_name)?.delete(&key);
    Ok(())
}

async fn handle_copy_session(
    stream: &mut TcpStream,
    zones: &[Arc<Zone>],
) -> Result<(), RelayError> {
    let zone_name = proto::read_string(stream, MAX_ZONENAME).await?;
    let key = proto::read_string(stream, SESSION_KEY_SIZE).await?;
    let id = proto::read_string(stream, MAX_SESSION_ID).await?;
    let host = proto::read_string(stream, MAX_HOSTNAME).await?;
    let port = stream.read_u16().await?;
    if port == 0 {
        return Err(RelayError::Protocol("owner port is zero"));
    }
    let host = canonical_host(host, port).await;
    let copies = proto::read_copy_set(stream).await?;
    let last_update = stream.read_i64().await?;
    let entries = proto::read_entries(stream).await?;

    find_store(zones, &zone_name)?.install_copy(
        &key,
        id,
        (host, port),
        copies,
        last_update,
        entries,
    );
    Ok(())
}

// Client side

async fn connect(host: &str, port: u16) -> Result<TcpStream, RelayError> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(RelayError::Protocol("connect timed out")),
    }
}

/// `HS` probe.
pub(crate) async fn hello(host: &str, port: u16) -> Result<(), RelayError> {
    let mut stream = connect(host, port).await?;
    stream.write_all(Command::Hello.code()).await?;
    let mut reply = [0u8; 2];
    timeout(CALL_TIMEOUT, stream.read_exact(&mut reply))
        .await
        .map_err(|_| RelayError::Protocol("hello timed out"))??;
    if &reply != HELLO_OK {
        return Err(RelayError::Protocol("unexpected hello reply"));
    }
    Ok(())
}

/// Session state returned by `RS`.
pub(crate) struct FetchedSession {
    pub(crate) last_update: i64,
    pub(crate) entries: Vec<(String, Vec<u8>)>,
}

/// `RS`: ask `owner` to hand the session over to `new_owner`.
pub(crate) async fn request_session(
    owner_host: &str,
    owner_port: u16,
    zone: &str,
    key: &str,
    new_owner_host: &str,
    new_owner_port: u16,
    new_owner_copies: &[CopyPeer],
) -> Result<FetchedSession, RelayError> {
    let mut stream = connect(owner_host, owner_port).await?;

    let mut frame = BytesMut::new();
    frame.put_slice(Command::RequestSession.code());
    proto::put_string(&mut frame, zone);
    proto::put_string(&mut frame, key);
    proto::put_string(&mut frame, new_owner_host);
    frame.put_u16(new_owner_port);
    proto::put_copy_set(&mut frame, new_owner_copies);
    stream.write_all(&frame).await?;

    let reply = timeout(CALL_TIMEOUT, async {
        let last_update = stream.read_i64().await?;
        let entries = proto::read_entries(&mut stream).await?;
        Ok::<_, RelayError>(FetchedSession {
            last_update,
            entries,
        })
    })
    .await
    .map_err(|_| RelayError::Protocol("request-session timed out"))??;

    Ok(reply)
}

/// `CO`: announce `new_owner` for the session to `peer`.
pub(crate) async fn change_owner(
    peer_host: &str,
    peer_port: u16,
    zone: &str,
    key: &str,
    new_owner_host: &str,
    new_owner_port: u16,
    new_owner_copies: &[CopyPeer],
) -> Result<(), RelayError> {
    let mut stream = connect(peer_host, peer_port).await?;

    let mut frame = BytesMut::new();
    frame.put_slice(Command::ChangeOwner.code());
    proto::put_string(&mut frame, zone);
    proto::put_string(&mut frame, key);
    proto::put_string(&mut frame, new_owner_host);
    frame.put_u16(new_owner_port);
    proto::put_copy_set(&mut frame, new_owner_copies);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// `QT`: the session's last-update timestamp as known by `peer`.
pub(crate) async fn query_timestamp(
    peer_host: &str,
    peer_port: u16,
    zone: &str,
    key: &str,
) -> Result<i64, RelayError> {
    let mut stream = connect(peer_host, peer_port).await?;

    let mut frame = BytesMut::new();
    frame.put_slice(Command::QueryTimestamp.code());
    proto::put_string(&mut frame, zone);
    proto::put_string(&mut frame, key);
    stream.write_all(&frame).await?;

    timeout(CALL_TIMEOUT, stream.read_i64())
        .await
        .map_err(|_| RelayError::Protocol("timestamp query timed out"))?
        .map_err(Into::into)
}

/// `DS`: delete the session on `peer`.
pub(crate) async fn delete_session(
    peer_host: &str,
    peer_port: u16,
    zone: &str,
    key: &str,
) -> Result<(), RelayError> {
    let mut stream = connect(peer_host, peer_port).await?;

    let mut frame = BytesMut::new();
    frame.put_slice(Command::DeleteSession.code());
    proto::put_string(&mut frame, zone);
    proto::put_string(&mut frame, key);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// `CS`: install `snapshot` on `peer` without ownership.
pub(crate) async fn copy_session(
    peer_host: &str,
    peer_port: u16,
    snapshot: &SessionSnapshot,
) -> Result<(), RelayError> {
    let mut stream = connect(peer_host, peer_port).await?;

    let mut frame = BytesMut::new();
    frame.put_slice(Command::CopySession.code());
    proto::put_string(&mut frame, &snapshot.zone);
    proto::put_string(&mut frame, &snapshot.key);
    proto::put_string(&mut frame, &snapshot.id);
    proto::put_string(&mut frame, &snapshot.owner_host);
    frame.put_u16(snapshot.owner_port);
    proto::put_copy_set(&mut frame, &snapshot.copy_set);
    frame.put_i64(snapshot.last_update);
    proto::put_entries(&mut frame, &snapshot.entries);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Copy distributor: ships an owner's mutated session to every copy peer.
pub(crate) async fn broadcast_copy(snapshot: SessionSnapshot) {
    for peer in snapshot.copy_set.clone() {
        if let Err(err) = copy_session(&peer.host, peer.port, &snapshot).await {
            warn!(
                peer = %peer.host,
                zone = %snapshot.zone,
                error = %err,
                "session copy failed"
            );
        }
    }
}

/// Periodic `HS` probe of every copy peer.
pub(crate) async fn health_check(ctx: Arc<RelayContext>, shutdown: Arc<Shutdown>) {
    let tick = Duration::from_secs(ctx.check_interval.max(1));
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(tick) => {}
        }
        for peer in &ctx.copy_peers {
            match hello(&peer.host, peer.port).await {
                Ok(()) => debug!(peer = %peer.host, port = peer.port, "relay peer alive"),
                Err(err) => warn!(
                    peer = %peer.host,
                    port = peer.port,
                    error = %err,
                    "relay peer unreachable"
                ),
            }
        }
    }
}
