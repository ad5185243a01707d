use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::PieceIdx;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PieceKey {
    pub file: String,
    pub piece: PieceIdx,
}

impl PieceKey {
    pub fn new(file: impl Into<String>, piece: PieceIdx) -> Self {
        Self {
            file: file.into(),
            piece,
        }
    }
}

/// One-shot wake primitive handed to the thread waiting for an answer.
#[derive(Debug, Default)]
pub struct Signal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn notify(&self) {
        *self.fired.lock() = true;
        self.cond.notify_one();
    }

    /// Blocks until notified or until `timeout` elapses. Returns whether it was notified.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fired = self.fired.lock();
        while !*fired {
            if self.cond.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        *fired
    }
}

#[derive(Debug)]
struct Entry {
    touched: Instant,
    payload: Option<Bytes>,
    /// Peer of the current attempt.
    asked: SocketAddr,
    waiter: Arc<Signal>,
}

/// Outstanding and recently answered piece requests.
///
/// An answered entry keeps its payload until the janitor sweeps it, so a piece that was just
/// received can be handed to other peers asking for it without touching the disk.
#[derive(Debug, Default)]
pub struct PendingCache {
    entries: Mutex<HashMap<PieceKey, Entry>>,
}

impl PendingCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Starts a new attempt for `key` addressed to `peer` and returns the signal that its
    /// answer will fire. A previous "not owned" answer is forgotten, a real payload is kept.
    pub fn register(&self, key: &PieceKey, peer: SocketAddr) -> Arc<Signal> {
        let waiter = Arc::new(Signal::default());
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            touched: Instant::now(),
            payload: None,
            asked: peer,
            waiter: waiter.clone(),
        });
        entry.touched = Instant::now();
        entry.asked = peer;
        entry.waiter = waiter.clone();
        if entry.payload.as_ref().is_some_and(|p| p.is_empty()) {
            entry.payload = None;
        }
        waiter
    }

    /// Records an answer from `from` and wakes the current waiter. The first non-empty payload
    /// wins, whoever sent it. A "not owned" answer only counts when it comes from the peer of
    /// the current attempt. Answers nobody asked for are dropped and `false` is returned.
    pub fn fulfil(&self, key: &PieceKey, from: SocketAddr, payload: Bytes) -> bool {
        let mut entries = self.entries.lock();
        let entry = match entries.get_mut(key) {
            Some(entry) => entry,
            None => return false,
        };
        if payload.is_empty() && entry.asked != from {
            return false;
        }
        entry.touched = Instant::now();
        let filled = match &entry.payload {
            None => true,
            Some(current) => current.is_empty() && !payload.is_empty(),
        };
        if filled {
            entry.payload = Some(payload);
        }
        entry.waiter.notify();
        true
    }

    /// Forgets the payload of `key`, for answers found to be unusable.
    pub fn discard(&self, key: &PieceKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.payload = None;
        }
    }

    /// The answer recorded for `key`, possibly empty.
    pub fn payload(&self, key: &PieceKey) -> Option<Bytes> {
        self.entries.lock().get(key)?.payload.clone()
    }

    /// A non-empty payload received for `key`.
    pub fn cached(&self, key: &PieceKey) -> Option<Bytes> {
        self.payload(key).filter(|p| !p.is_empty())
    }

    /// Drops every entry of `file`.
    pub fn forget(&self, file: &str) {
        self.entries.lock().retain(|key, _| key.file != file);
    }

    /// Removes entries untouched for longer than `expire`, returning how many were removed.
    pub fn sweep(&self, expire: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.touched.elapsed() <= expire);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
