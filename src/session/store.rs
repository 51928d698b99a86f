//! Per-zone session store.
//!
//! A session is keyed by an opaque cookie value and holds named binary
//! attributes. `get`/`create`/`put`/`delete` are atomic at the entry level.
//! When a relay is configured, a request for a session this peer does not
//! own is satisfied by fetching state from the hinted owner (`RS`), after
//! which this peer becomes the owner; mutations are replicated to the
//! copy-set (`CS`) after the request completes.

use crate::{
    config::CopyPeer,
    errors::RelayError,
    http::request::Request,
    server::queue::Shutdown,
    session::{proto::SESSION_KEY_SIZE, relay, relay::RelayContext},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::warn;
use uuid::Uuid;

/// Cookie carrying the session key.
pub const SESSION_COOKIE: &str = "NESTA_SID";

#[derive(Debug, Clone)]
struct Session {
    id: String,
    last_update_us: i64,
    owner_flag: bool,
    owner: Option<(String, u16)>,
    owner_copies: Vec<CopyPeer>,
    attrs: HashMap<String, Vec<u8>>,
    dirty: bool,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            last_update_us: now_us(),
            owner_flag: true,
            owner: None,
            owner_copies: Vec::new(),
            attrs: HashMap::new(),
            dirty: false,
        }
    }
}

/// Complete session state as shipped by `CS` and returned by `RS`.
#[derive(Debug, Clone)]
pub(crate) struct SessionSnapshot {
    pub(crate) zone: String,
    pub(crate) key: String,
    pub(crate) id: String,
    pub(crate) owner_host: String,
    pub(crate) owner_port: u16,
    pub(crate) copy_set: Vec<CopyPeer>,
    pub(crate) last_update: i64,
    pub(crate) entries: Vec<(String, Vec<u8>)>,
}

struct StoreInner {
    zone_name: String,
    max_session: i64,
    session_timeout: i64,
    relay: Option<Arc<RelayContext>>,
    map: Mutex<HashMap<String, Session>>,
    /// Keys mutated since the last copy-set sweep; a key appears at most
    /// once (guarded by the per-session dirty flag).
    dirty_keys: Mutex<Vec<String>>,
}

/// Session store owned by one application zone.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub(crate) fn new(
        zone_name: &str,
        max_session: i64,
        session_timeout: i64,
        relay: Option<Arc<RelayContext>>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                zone_name: zone_name.to_owned(),
                max_session,
                session_timeout,
                relay,
                map: Mutex::new(HashMap::new()),
                dirty_keys: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn zone_name(&self) -> &str {
        &self.inner.zone_name
    }

    pub fn len(&self) -> usize {
        self.inner.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a new session with a generated key. Returns `None` when the
    /// store is at its configured capacity.
    pub fn create(&self) -> Option<SessionHandle> {
        let mut map = self.inner.map.lock();
        if self.inner.max_session > 0 && map.len() >= self.inner.max_session as usize {
            warn!(
                zone = %self.inner.zone_name,
                cap = self.inner.max_session,
                "session store at capacity, creation refused"
            );
            return None;
        }
        let key = Uuid::new_v4().simple().to_string();
        let id = Uuid::new_v4().simple().to_string();
        map.insert(key.clone(), Session::new(id));
        Some(SessionHandle {
            inner: self.inner.clone(),
            key,
        })
    }

    /// Returns a handle to the session with `key` if it exists locally.
    pub fn get(&self, key: &str) -> Option<SessionHandle> {
        let map = self.inner.map.lock();
        map.contains_key(key).then(|| SessionHandle {
            inner: self.inner.clone(),
            key: key.to_owned(),
        })
    }

    /// Binds a request to its session via the session cookie. When this peer
    /// is not the owner, the hinted owner is asked to hand the session over;
    /// on failure the local (possibly stale) state is used.
    pub(crate) async fn bind_request(&self, request: &Request) -> Option<SessionHandle> {
        let key = session_key_from(request)?;
        let (hint, old_copies) = {
            let map = self.inner.map.lock();
            let session = map.get(&key)?;
            if session.owner_flag {
                (None, Vec::new())
            } else {
                (session.owner.clone(), session.owner_copies.clone())
            }
        };

        if let (Some((owner_host, owner_port)), Some(relay_ctx)) = (hint, self.inner.relay.as_ref())
        {
            match relay::request_session(
                &owner_host,
                owner_port,
                &self.inner.zone_name,
                &key,
                &relay_ctx.host,
                relay_ctx.port,
                &relay_ctx.copy_peers,
            )
            .await
            {
                Ok(fetched) => {
                    self.adopt(&key, fetched.last_update, fetched.entries);
                    self.announce_owner_change(&key, old_copies);
                }
                Err(err) => warn!(
                    zone = %self.inner.zone_name,
                    owner = %owner_host,
                    error = %err,
                    "session hand-over failed, using local state"
                ),
            }
        }

        Some(SessionHandle {
            inner: self.inner.clone(),
            key,
        })
    }

    /// Tells the previous owner's copy peers who owns the session now.
    fn announce_owner_change(&self, key: &str, targets: Vec<CopyPeer>) {
        let Some(relay_ctx) = self.inner.relay.clone() else {
            return;
        };
        let zone = self.inner.zone_name.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            for peer in targets {
                if peer.host == relay_ctx.host && peer.port == relay_ctx.port {
                    continue;
                }
                if let Err(err) = relay::change_owner(
                    &peer.host,
                    peer.port,
                    &zone,
                    &key,
                    &relay_ctx.host,
                    relay_ctx.port,
                    &relay_ctx.copy_peers,
                )
                .await
                {
                    warn!(peer = %peer.host, error = %err, "owner-change announcement failed");
                }
            }
        });
    }

    /// Snapshot for `CS` replication. Returns `Some` only when the session
    /// was mutated since the last snapshot and this peer owns it; the dirty
    /// mark is cleared.
    pub(crate) fn take_copy_snapshot(&self, key: &str) -> Option<SessionSnapshot> {
        let relay_ctx = self.inner.relay.as_ref()?;
        let mut map = self.inner.map.lock();
        let session = map.get_mut(key)?;
        let was_dirty = std::mem::replace(&mut session.dirty, false);
        if !was_dirty || !session.owner_flag || relay_ctx.copy_peers.is_empty() {
            return None;
        }
        Some(SessionSnapshot {
            zone: self.inner.zone_name.clone(),
            key: key.to_owned(),
            id: session.id.clone(),
            owner_host: relay_ctx.host.clone(),
            owner_port: relay_ctx.port,
            copy_set: relay_ctx.copy_peers.clone(),
            last_update: session.last_update_us,
            entries: session.attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    /// Snapshots of every owned session mutated since the previous sweep.
    /// The worker ships these to the copy-set after the request completes.
    pub(crate) fn take_dirty_snapshots(&self) -> Vec<SessionSnapshot> {
        if self.inner.relay.is_none() {
            return Vec::new();
        }
        let keys = std::mem::take(&mut *self.inner.dirty_keys.lock());
        keys.iter()
            .filter_map(|key| self.take_copy_snapshot(key))
            .collect()
    }

    // Relay server entry points.

    /// `RS`: hand the session over to `new_owner`, returning its state. The
    /// local copy stays, demoted to a non-owner pointing at the new owner.
    pub(crate) fn transfer_ownership(
        &self,
        key: &str,
        new_owner: (String, u16),
        copies: Vec<CopyPeer>,
    ) -> Result<(i64, Vec<(String, Vec<u8>)>), RelayError> {
        let mut map = self.inner.map.lock();
        let session = map.get_mut(key).ok_or(RelayError::NoSession)?;
        session.owner = Some(new_owner);
        session.owner_copies = copies;
        session.owner_flag = false;
        let entries = session
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok((session.last_update_us, entries))
    }

    /// `CO`: record the announced owner and drop our own ownership.
    pub(crate) fn set_owner_hint(
        &self,
        key: &str,
        owner: (String, u16),
        copies: Vec<CopyPeer>,
    ) -> Result<(), RelayError> {
        let mut map = self.inner.map.lock();
        let session = map.get_mut(key).ok_or(RelayError::NoSession)?;
        session.owner = Some(owner);
        session.owner_copies = copies;
        session.owner_flag = false;
        Ok(())
    }

    /// `QT` support: the local timestamp plus the owner hint to consult when
    /// this peer is not authoritative.
    pub(crate) fn timestamp(
        &self,
        key: &str,
    ) -> Result<(i64, Option<(String, u16)>), RelayError> {
        let map = self.inner.map.lock();
        let session = map.get(key).ok_or(RelayError::NoSession)?;
        let hint = (!session.owner_flag)
            .then(|| session.owner.clone())
            .flatten();
        Ok((session.last_update_us, hint))
    }

    /// `DS`: removing an absent key is a no-op.
    pub(crate) fn delete(&self, key: &str) {
        self.inner.map.lock().remove(key);
    }

    /// Removes the session locally and tells the copy peers to drop their
    /// copies too. Must be called from within the server's runtime.
    pub fn destroy(&self, key: &str) {
        self.inner.map.lock().remove(key);
        let Some(relay_ctx) = self.inner.relay.clone() else {
            return;
        };
        let zone = self.inner.zone_name.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            for peer in &relay_ctx.copy_peers {
                if let Err(err) =
                    relay::delete_session(&peer.host, peer.port, &zone, &key).await
                {
                    warn!(peer = %peer.host, error = %err, "session delete broadcast failed");
                }
            }
        });
    }

    /// Applies state fetched from the previous owner; this peer becomes the
    /// owner.
    pub(crate) fn adopt(&self, key: &str, last_update: i64, entries: Vec<(String, Vec<u8>)>) {
        let mut map = self.inner.map.lock();
        let session = map
            .entry(key.to_owned())
            .or_insert_with(|| Session::new(Uuid::new_v4().simple().to_string()));
        session.attrs = entries.into_iter().collect();
        session.last_update_us = last_update;
        session.owner_flag = true;
        session.owner = None;
        session.owner_copies = Vec::new();
        session.dirty = false;
    }

    /// `CS`: install a complete snapshot without taking ownership.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn install_copy(
        &self,
        key: &str,
        id: String,
        owner: (String, u16),
        copies: Vec<CopyPeer>,
        last_update: i64,
        entries: Vec<(String, Vec<u8>)>,
    ) {
        let mut map = self.inner.map.lock();
        let session = map
            .entry(key.to_owned())
            .or_insert_with(|| Session::new(id.clone()));
        session.id = id;
        session.attrs = entries.into_iter().collect();
        session.owner = Some(owner);
        session.owner_copies = copies;
        session.owner_flag = false;
        session.last_update_us = last_update;
        session.dirty = false;
    }

    /// Spawns the TTL reaper when this store has a timeout configured.
    pub(crate) fn spawn_reaper(&self, shutdown: Arc<Shutdown>) {
        if self.inner.session_timeout <= 0 {
            return;
        }
        let inner = self.inner.clone();
        let timeout_us = self.inner.session_timeout * 1_000_000;
        let tick = Duration::from_secs((self.inner.session_timeout as u64).clamp(1, 60));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
                let now = now_us();
                let mut map = inner.map.lock();
                let before = map.len();
                map.retain(|_, s| now - s.last_update_us <= timeout_us);
                let evicted = before - map.len();
                if evicted > 0 {
                    tracing::debug!(zone = %inner.zone_name, evicted, "sessions expired");
                }
            }
        });
    }
}

/// Cheap, cloneable reference to one session entry. All accessors take the
/// store lock for the duration of the call only.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<StoreInner>,
    key: String,
}

impl SessionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> Option<String> {
        self.inner.map.lock().get(&self.key).map(|s| s.id.clone())
    }

    /// `Set-Cookie` value binding this session to the client.
    pub fn cookie(&self) -> String {
        format!("{SESSION_COOKIE}={}; Path=/", self.key)
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.inner
            .map
            .lock()
            .get(&self.key)
            .and_then(|s| s.attrs.get(name).cloned())
    }

    pub fn put(&self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let mut map = self.inner.map.lock();
        if let Some(session) = map.get_mut(&self.key) {
            session.attrs.insert(name.into(), value.into());
            session.last_update_us = now_us();
            if !std::mem::replace(&mut session.dirty, true) {
                self.inner.dirty_keys.lock().push(self.key.clone());
            }
        }
    }

    pub fn delete(&self, name: &str) {
        let mut map = self.inner.map.lock();
        if let Some(session) = map.get_mut(&self.key) {
            if session.attrs.remove(name).is_some() {
                session.last_update_us = now_us();
                if !std::mem::replace(&mut session.dirty, true) {
                    self.inner.dirty_keys.lock().push(self.key.clone());
                }
            }
        }
    }

    pub fn last_update(&self) -> Option<i64> {
        self.inner
            .map
            .lock()
            .get(&self.key)
            .map(|s| s.last_update_us)
    }

    /// Whether this peer currently owns the session.
    pub fn is_owner(&self) -> bool {
        self.inner
            .map
            .lock()
            .get(&self.key)
            .map(|s| s.owner_flag)
            .unwrap_or(false)
    }
}

/// Extracts the session key from the request's cookie header.
pub(crate) fn session_key_from(request: &Request) -> Option<String> {
    let cookies = request.header("cookie")?;
    for pair in cookies.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if name == SESSION_COOKIE && !value.is_empty() && value.len() <= SESSION_KEY_SIZE {
                return Some(value.to_owned());
            }
        }
    }
    None
}

#[inline]
pub(crate) fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
