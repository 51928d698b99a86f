//! Connection hand-off queue and the cooperative shutdown latch.

use crossbeam::queue::SegQueue;
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{net::TcpStream, sync::Notify, time::timeout};

pub(crate) type QueueItem = (TcpStream, SocketAddr);

/// Multi-producer / multi-consumer FIFO of accepted connections.
///
/// `push` signals one waiting consumer per call; `is_empty` is wait-free so
/// the dispatcher can evaluate its elasticity rule without blocking. A
/// consumer that pops an item while more remain passes the wake-up on, so a
/// burst of pushes never strands queued work behind a coalesced signal.
pub(crate) struct RequestQueue {
    queue: SegQueue<QueueItem>,
    ready: Notify,
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            ready: Notify::new(),
        }
    }

    pub(crate) fn push(&self, item: QueueItem) {
        self.queue.push(item);
        self.ready.notify_one();
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Blocks until an item is available.
    pub(crate) async fn pop(&self) -> QueueItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.ready.notified().await;
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `wait`. Used by elastic
    /// worker slots so they can evaluate their idle-retirement rule.
    pub(crate) async fn pop_timeout(&self, wait: Duration) -> Option<QueueItem> {
        match timeout(wait, self.pop()).await {
            Ok(item) => Some(item),
            Err(_) => None,
        }
    }

    #[inline]
    fn try_pop(&self) -> Option<QueueItem> {
        let item = self.queue.pop();
        if item.is_some() && !self.queue.is_empty() {
            self.ready.notify_one();
        }
        item
    }
}

/// Cooperative shutdown: a flag polled between work items plus a wake-up for
/// everything parked on a queue or an accept call.
pub(crate) struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[inline]
    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Completes once shutdown has been triggered.
    pub(crate) async fn wait(&self) {
        while !self.is_set() {
            self.notify.notified().await;
        }
    }
}
