//! Worker pool: slot table, the per-worker service loop, and the keep-alive
//! request loop.
//!
//! Boss/worker scheme: workers are pre-spawned and park on the request
//! queue; the dispatcher only accepts and enqueues. Slots `[0, N0)` are
//! permanent; slots `[N0, Nmax)` are spawned under queue pressure and retire
//! after idling past the configured timeout.

use crate::{
    access_log::{client_ip, AccessRecord},
    command,
    document::{self, error_payload, head_payload},
    errors::RequestError,
    http::{
        request::{Request, RequestReader},
        response::Response,
        types::{Method, StatusCode, Version},
    },
    server::server_impl::ServerInner,
    session::{relay, store::now_us},
    zone::HandlerContext,
};
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing::{debug, info};

pub(crate) const SLOT_UNUSED: u8 = 0;
pub(crate) const SLOT_SLEEPING: u8 = 1;
pub(crate) const SLOT_RUNNING: u8 = 2;

/// One worker slot. Status and counters are atomics so the status command
/// can snapshot the table without holding the pool lock; stale reads are
/// acceptable there.
pub(crate) struct WorkerSlot {
    status: AtomicU8,
    command_flag: AtomicBool,
    last_access_us: AtomicI64,
    count: AtomicU64,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(SLOT_UNUSED),
            command_flag: AtomicBool::new(false),
            last_access_us: AtomicI64::new(0),
            count: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::Release);
    }

    #[inline]
    fn set_command_flag(&self, value: bool) {
        self.command_flag.store(value, Ordering::Release);
    }

    #[inline]
    fn touch(&self) {
        self.last_access_us.store(now_us(), Ordering::Release);
    }

    fn idle_exceeded(&self, timeout_secs: u64) -> bool {
        let last = self.last_access_us.load(Ordering::Acquire);
        now_us() - last > (timeout_secs as i64) * 1_000_000
    }
}

/// Rendered row for the status command.
pub(crate) struct SlotSnapshot {
    pub(crate) status: u8,
    pub(crate) command: bool,
    pub(crate) last_access_us: i64,
    pub(crate) count: u64,
}

/// Worker slot table. One mutex guards the pool membership changes (spawn
/// and retire); the running-count invariant `active == |status != UNUSED|`
/// is maintained under it.
pub(crate) struct WorkerTable {
    slots: Box<[WorkerSlot]>,
    base: usize,
    active: Mutex<usize>,
}

impl WorkerTable {
    pub(crate) fn new(base: usize, max: usize) -> Self {
        let slots = (0..max).map(|_| WorkerSlot::new()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            base,
            active: Mutex::new(0),
        }
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &WorkerSlot {
        &self.slots[index]
    }

    pub(crate) fn active(&self) -> usize {
        *self.active.lock()
    }

    /// Marks a base slot alive at startup.
    pub(crate) fn reserve_base(&self, index: usize) {
        debug_assert!(index < self.base);
        let mut active = self.active.lock();
        let slot = &self.slots[index];
        slot.set_status(SLOT_SLEEPING);
        slot.touch();
        *active += 1;
    }

    /// Claims the lowest unused elastic slot, if any.
    pub(crate) fn try_reserve_extended(&self) -> Option<usize> {
        let mut active = self.active.lock();
        for index in self.base..self.slots.len() {
            let slot = &self.slots[index];
            if slot.status.load(Ordering::Acquire) == SLOT_UNUSED {
                slot.set_status(SLOT_SLEEPING);
                slot.touch();
                *active += 1;
                return Some(index);
            }
        }
        None
    }

    /// Returns a slot to the unused pool.
    pub(crate) fn retire(&self, index: usize) {
        let mut active = self.active.lock();
        self.slots[index].set_status(SLOT_UNUSED);
        self.slots[index].set_command_flag(false);
        *active -= 1;
    }

    /// Lock-free sum of the per-slot request counters; may be slightly
    /// stale.
    pub(crate) fn total_requests(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.count.load(Ordering::Relaxed))
            .sum()
    }

    pub(crate) fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .map(|s| SlotSnapshot {
                status: s.status.load(Ordering::Acquire),
                command: s.command_flag.load(Ordering::Acquire),
                last_access_us: s.last_access_us.load(Ordering::Acquire),
                count: s.count.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Worker service loop for one slot. `elastic` slots wait with a timeout and
/// retire after idling past `worker_thread_timeout`; base slots park until
/// signaled.
pub(crate) async fn run_worker(inner: Arc<ServerInner>, slot_no: usize, elastic: bool) {
    let check_interval = Duration::from_secs(inner.config.worker_thread_check_interval.max(1));

    loop {
        if inner.shutdown.is_set() {
            break;
        }
        inner.workers.slot(slot_no).set_status(SLOT_SLEEPING);

        let item = if elastic {
            tokio::select! {
                _ = inner.shutdown.wait() => break,
                item = inner.queue.pop_timeout(check_interval) => item,
            }
        } else {
            tokio::select! {
                _ = inner.shutdown.wait() => break,
                item = inner.queue.pop() => Some(item),
            }
        };

        let Some((stream, peer)) = item else {
            // idle-timeout tick for an elastic slot
            if inner
                .workers
                .slot(slot_no)
                .idle_exceeded(inner.config.worker_thread_timeout)
            {
                debug!(slot = slot_no, "elastic worker retiring after idle timeout");
                break;
            }
            continue;
        };
        if inner.shutdown.is_set() {
            break;
        }

        inner.workers.slot(slot_no).set_status(SLOT_RUNNING);
        handle_connection(&inner, stream, peer, slot_no).await;
    }

    inner.workers.retire(slot_no);
}

struct DispatchOutcome {
    status: u16,
    bytes: usize,
    keep_alive: bool,
    command: bool,
}

/// Keep-alive loop: requests on one connection are served strictly one
/// after another; the connection closes on error, on an exhausted budget, or
/// on read idleness.
async fn handle_connection(
    inner: &Arc<ServerInner>,
    mut stream: TcpStream,
    peer: SocketAddr,
    slot_no: usize,
) {
    let slot = inner.workers.slot(slot_no);
    let mut reader = RequestReader::new();
    let mut budget = inner.config.keep_alive_requests;

    loop {
        slot.set_command_flag(false);

        let request = match reader.read_request(&mut stream, peer).await {
            Ok(request) => request,
            Err(RequestError::Closed) => break,
            Err(err) => {
                debug!(%peer, status = err.status_code(), "request error: {err:?}");
                let _ = stream.write_all(err.as_http(Version::Http11)).await;
                break;
            }
        };

        if inner.trace_enabled() {
            info!(%peer, method = request.method().as_str(), uri = request.uri(), "request");
        }

        let client_keep_alive = request
            .header("connection")
            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false);
        let window_allowed = client_keep_alive && budget > 0;

        let outcome = match dispatch(inner, &mut stream, &request, slot_no, window_allowed, budget)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(%peer, error = %err, "response write failed");
                break;
            }
        };

        if !outcome.command {
            inner.access_log.write(&AccessRecord {
                ip: client_ip(request.header("x-forwarded-for"), peer.ip()),
                method: request.method().as_str(),
                uri: request.uri(),
                protocol: request.version().as_str(),
                user_agent: request.header("user-agent").unwrap_or("-"),
                status: outcome.status,
                bytes: outcome.bytes,
                elapsed_us: now_us() - request.start_us(),
            });
            slot.touch();
            slot.count.fetch_add(1, Ordering::Relaxed);
        }

        if !outcome.keep_alive {
            break;
        }
        budget = budget.saturating_sub(1);
        if budget == 0 || inner.shutdown.is_set() {
            break;
        }
        let wait = Duration::from_secs(inner.config.keep_alive_timeout);
        if !reader.wait_for_data(&stream, wait).await {
            break;
        }
    }
    // dropping the stream closes the connection
}

/// Classifies one request: control command, HEAD, registered handler, or
/// static file.
async fn dispatch(
    inner: &Arc<ServerInner>,
    stream: &mut TcpStream,
    request: &Request,
    slot_no: usize,
    window_allowed: bool,
    budget: u32,
) -> std::io::Result<DispatchOutcome> {
    let version = request.version();
    let window = window_allowed.then_some((inner.config.keep_alive_timeout, budget));

    if command::is_command(request) {
        inner.workers.slot(slot_no).set_command_flag(true);
        let body = command::execute(inner, request).await;
        let mut response = Response::new();
        response
            .status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body(&body);
        let bytes = response.content_bytes();
        stream.write_all(&response.finish(version, None, false)).await?;
        return Ok(DispatchOutcome {
            status: 200,
            bytes,
            keep_alive: false,
            command: true,
        });
    }

    if request.method() == Method::Head {
        stream.write_all(&head_payload(version)).await?;
        return Ok(DispatchOutcome {
            status: 200,
            bytes: 0,
            keep_alive: false,
            command: false,
        });
    }

    if request.content_name().is_empty() {
        let (payload, bytes) = error_payload(StatusCode::NotFound, version);
        stream.write_all(&payload).await?;
        return Ok(DispatchOutcome {
            status: 404,
            bytes,
            keep_alive: false,
            command: false,
        });
    }

    if let Some(binding) = inner.bindings.get(request.content_name()) {
        let session = match binding.zone.sessions() {
            Some(store) => store.bind_request(request).await,
            None => None,
        };
        let ctx = HandlerContext::new(binding.zone.clone(), session, inner.user_params.clone());

        let mut response = Response::new();
        let status = binding.handler.handle(request, &mut response, &ctx).await;
        response.status(status);

        let keep = response.wants_keep_alive() && window_allowed;
        let window = keep.then_some((inner.config.keep_alive_timeout, budget));
        let bytes = response.content_bytes();
        stream.write_all(&response.finish(version, window, false)).await?;

        // replicate mutated sessions to the copy-set
        if let Some(store) = binding.zone.sessions() {
            for snapshot in store.take_dirty_snapshots() {
                tokio::spawn(relay::broadcast_copy(snapshot));
            }
        }

        if status.as_u16() >= 500 {
            debug!(content = request.content_name(), status = status.as_u16(), "handler error");
        }
        return Ok(DispatchOutcome {
            status: status.as_u16(),
            bytes,
            keep_alive: keep,
            command: false,
        });
    }

    // static file
    let root = match (&inner.config.document_root, document::check_file(request.content_name())) {
        (Some(root), true) => root,
        (root, ok) => {
            if !ok {
                debug!(peer = %request.peer(), path = request.content_name(), "file check error");
            } else if root.is_none() {
                debug!("document root is empty");
            }
            let (payload, bytes) = error_payload(StatusCode::NotFound, version);
            stream.write_all(&payload).await?;
            return Ok(DispatchOutcome {
                status: 404,
                bytes,
                keep_alive: false,
                command: false,
            });
        }
    };

    let outcome = document::send_document(
        stream,
        root,
        request.content_name(),
        request.header("if-modified-since"),
        inner.cache.as_ref(),
        version,
        window,
    )
    .await?;
    Ok(DispatchOutcome {
        status: outcome.status,
        bytes: outcome.bytes,
        keep_alive: outcome.keep_alive,
        command: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_retire_track_active_count() {
        let table = WorkerTable::new(2, 5);
        table.reserve_base(0);
        table.reserve_base(1);
        assert_eq!(table.active(), 2);

        let slot = table.try_reserve_extended().unwrap();
        assert_eq!(slot, 2);
        assert_eq!(table.active(), 3);

        table.retire(slot);
        assert_eq!(table.active(), 2);
        // retired slot is reusable and still the lowest
        assert_eq!(table.try_reserve_extended(), Some(2));
    }

    #[test]
    fn extended_reservation_exhausts_at_max() {
        let table = WorkerTable::new(1, 3);
        table.reserve_base(0);
        assert_eq!(table.try_reserve_extended(), Some(1));
        assert_eq!(table.try_reserve_extended(), Some(2));
        assert_eq!(table.try_reserve_extended(), None);
        assert_eq!(table.active(), 3);
    }

    #[test]
    fn snapshot_reflects_slot_states() {
        let table = WorkerTable::new(1, 2);
        table.reserve_base(0);
        table.slot(0).count.fetch_add(3, Ordering::Relaxed);

        let rows = table.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, SLOT_SLEEPING);
        assert_eq!(rows[0].count, 3);
        assert_eq!(rows[1].status, SLOT_UNUSED);
        assert_eq!(table.total_requests(), 3);
    }

    #[test]
    fn idle_detection_uses_last_access() {
        let slot = WorkerSlot::new();
        slot.touch();
        assert!(!slot.idle_exceeded(600));
        slot.last_access_us
            .store(now_us() - 601 * 1_000_000, Ordering::Release);
        assert!(slot.idle_exceeded(600));
    }
}
