//! The registry of outstanding client requests, keyed by log index.
//!
//! Requests are registered when their entry is appended and resolved at most once, when
//! the entry is applied (or when the leader steps down / shuts down). Keeping the map
//! indexed by log position breaks the request -> node -> request reference cycle the
//! callback style would otherwise create.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::core::Responder;
use crate::AppData;
use crate::AppDataResponse;

/// The kind of entry a pending request is tied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Command,
    Barrier,
    Change,
}

/// An outstanding client request tied to a log index.
pub(crate) struct PendingRequest<D: AppData, R: AppDataResponse> {
    pub index: u64,
    pub kind: RequestKind,
    pub enqueued_at: Instant,
    pub responder: Responder<D, R>,
}

/// An indexed queue of pending client callbacks.
pub(crate) struct RequestRegistry<D: AppData, R: AppDataResponse> {
    requests: BTreeMap<u64, PendingRequest<D, R>>,
}

impl<D: AppData, R: AppDataResponse> RequestRegistry<D, R> {
    pub fn new() -> Self {
        RequestRegistry {
            requests: BTreeMap::new(),
        }
    }

    /// Register a request for the given index. There may be at most one request per
    /// index; a second registration for the same slot is a usage bug.
    pub fn enqueue(&mut self, index: u64, kind: RequestKind, responder: Responder<D, R>) {
        let prev = self.requests.insert(index, PendingRequest {
            index,
            kind,
            enqueued_at: Instant::now(),
            responder,
        });
        debug_assert!(prev.is_none(), "duplicate pending request at index {}", index);
    }

    /// Remove and return the request registered at the given index, if any.
    pub fn remove_at(&mut self, index: u64) -> Option<PendingRequest<D, R>> {
        self.requests.remove(&index)
    }

    /// Remove and return all requests matching the predicate, in log order.
    pub fn drain(&mut self, mut predicate: impl FnMut(&PendingRequest<D, R>) -> bool) -> Vec<PendingRequest<D, R>> {
        let indexes: Vec<u64> =
            self.requests.values().filter(|req| predicate(req)).map(|req| req.index).collect();
        indexes.into_iter().filter_map(|idx| self.requests.remove(&idx)).collect()
    }

    /// Remove and return all pending requests, in log order.
    pub fn drain_all(&mut self) -> Vec<PendingRequest<D, R>> {
        let requests = std::mem::take(&mut self.requests);
        requests.into_iter().map(|(_, req)| req).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
