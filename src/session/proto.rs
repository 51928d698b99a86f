//! Session-relay wire protocol.
//!
//! Framing: one command per connection. A command starts with two ASCII
//! bytes naming it; integers are big-endian; strings are a 16-bit length
//! followed by that many bytes, no terminator. Zero-length strings are
//! invalid on the wire.

use crate::{config::CopyPeer, errors::RelayError};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) const MAX_HOSTNAME: usize = 256;
pub(crate) const MAX_ZONENAME: usize = 64;
pub(crate) const SESSION_KEY_SIZE: usize = 128;
pub(crate) const MAX_SESSION_ID: usize = 64;
pub(crate) const MAX_ATTR_KEYSIZE: usize = 128;

/// `HS` reply payload.
pub(crate) const HELLO_OK: &[u8; 2] = b"OK";

/// Relay commands, identified by their two-byte wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// `HS` liveness probe
    Hello,
    /// `RS` request session state, transferring ownership to the caller
    RequestSession,
    /// `CO` announce a new owner
    ChangeOwner,
    /// `QT` query a session's last-update timestamp
    QueryTimestamp,
    /// `DS` delete a session locally
    DeleteSession,
    /// `CS` install a session snapshot without ownership
    CopySession,
}

impl Command {
    pub(crate) const fn code(self) -> &'static [u8; 2] {
        match self {
            Command::Hello => b"HS",
            Command::RequestSession => b"RS",
            Command::ChangeOwner => b"CO",
            Command::QueryTimestamp => b"QT",
            Command::DeleteSession => b"DS",
            Command::CopySession => b"CS",
        }
    }

    pub(crate) const fn from_code(code: [u8; 2]) -> Option<Command> {
        match &code {
            b"HS" => Some(Command::Hello),
            b"RS" => Some(Command::RequestSession),
            b"CO" => Some(Command::ChangeOwner),
            b"QT" => Some(Command::QueryTimestamp),
            b"DS" => Some(Command::DeleteSession),
            b"CS" => Some(Command::CopySession),
            _ => None,
        }
    }
}

pub(crate) async fn read_command<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Command, RelayError> {
    let mut code = [0u8; 2];
    stream.read_exact(&mut code).await?;
    Command::from_code(code).ok_or(RelayError::UnknownCommand(code))
}

/// Reads a length-prefixed string; the length must be in `1..=max`.
pub(crate) async fn read_string<S: AsyncRead + Unpin>(
    stream: &mut S,
    max: usize,
) -> Result<String, RelayError> {
    let len = stream.read_u16().await? as usize;
    if len == 0 || len > max {
        return Err(RelayError::Protocol("string length out of bounds"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| RelayError::Protocol("string is not utf-8"))
}

/// Reads a value blob (`u16` length + bytes); length must be `>= 1`.
pub(crate) async fn read_value<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Vec<u8>, RelayError> {
    let len = stream.read_u16().await? as usize;
    if len == 0 {
        return Err(RelayError::Protocol("zero-length value"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads a copy-set frame: `count:u16`, then `count` × (host, port). Ports
/// must be nonzero.
pub(crate) async fn read_copy_set<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Vec<CopyPeer>, RelayError> {
    let count = stream.read_u16().await? as usize;
    if count > crate::config::MAX_COPY {
        return Err(RelayError::Protocol("copy set too large"));
    }
    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        let host = read_string(stream, MAX_HOSTNAME).await?;
        let port = stream.read_u16().await?;
        if port == 0 {
            return Err(RelayError::Protocol("copy peer port is zero"));
        }
        peers.push(CopyPeer { host, port });
    }
    Ok(peers)
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn put_value(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

pub(crate) fn put_copy_set(buf: &mut BytesMut, peers: &[CopyPeer]) {
    buf.put_u16(peers.len() as u16);
    for peer in peers {
        put_string(buf, &peer.host);
        buf.put_u16(peer.port);
    }
}

/// Session attributes carried by `RS` replies and `CS` requests: zero-length
/// values are suppressed by the sender and excluded from the count.
pub(crate) fn put_entries(buf: &mut BytesMut, entries: &[(String, Vec<u8>)]) {
    let sized: Vec<&(String, Vec<u8>)> = entries.iter().filter(|(_, v)| !v.is_empty()).collect();
    buf.put_u16(sized.len() as u16);
    for (key, value) in sized {
        put_string(buf, key);
        put_value(buf, value);
    }
}

pub(crate) async fn read_entries<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Vec<(String, Vec<u8>)>, RelayError> {
    let count = stream.read_u16().await? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key = read_string(stream, MAX_ATTR_KEYSIZE).await?;
        let value = read_value(stream).await?;
        entries.push((key, value));
    }
    Ok(entries)
}
