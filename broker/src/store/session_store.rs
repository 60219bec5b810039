// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Per-client durable state: the [`Session`] record plus the three pieces
//! of queue-shaped state that only make sense scoped to one client id
//! (outbound queue, packet id limiter, QoS 2 dedup set). Kept together so
//! the reaper can drop all four with a single map removal once a session's
//! expiry interval elapses.
//!
//! Storage is pluggable behind [`SessionBackend`]: [`SessionStore`] holds a
//! `Box<dyn SessionBackend>` rather than a bare `HashMap`, so a network- or
//! disk-backed implementation can replace [`InMemorySessionBackend`] without
//! touching any call site elsewhere in the engine.

use std::collections::HashMap;
use std::time::Instant;

use crate::session::Session;
use crate::store::packet_id::PacketIdLimiter;
use crate::store::queue::OutboundQueue;
use crate::store::unack::UnackStore;

pub struct SessionRecord {
    pub session: Session,
    pub queue: OutboundQueue,
    pub packet_ids: PacketIdLimiter,
    pub unack: UnackStore,
}

impl SessionRecord {
    #[must_use]
    pub fn new(session: Session, max_queue_len: usize, max_packet_size: u32, inflight_expiry: Option<std::time::Duration>) -> Self {
        Self {
            session,
            queue: OutboundQueue::new(max_queue_len, inflight_expiry, max_packet_size),
            packet_ids: PacketIdLimiter::new(u16::MAX as usize - 1),
            unack: UnackStore::new(),
        }
    }
}

/// Storage backend for session records, keyed by client id. The only
/// implementor shipped today is [`InMemorySessionBackend`]; the trait
/// exists so a persistent (disk or network) backend can be swapped in
/// without [`SessionStore`]'s callers changing.
pub trait SessionBackend: Send {
    fn get(&self, client_id: &str) -> Option<&SessionRecord>;
    fn get_mut(&mut self, client_id: &str) -> Option<&mut SessionRecord>;
    fn contains(&self, client_id: &str) -> bool;
    fn insert(&mut self, record: SessionRecord);
    fn remove(&mut self, client_id: &str) -> Option<SessionRecord>;
    /// Every client id currently stored, used by the reaper sweep instead
    /// of requiring the backend to expose an iterator type.
    fn client_ids(&self) -> Vec<String>;
    fn len(&self) -> usize;
}

#[derive(Default)]
pub struct InMemorySessionBackend {
    records: HashMap<String, SessionRecord>,
}

impl SessionBackend for InMemorySessionBackend {
    fn get(&self, client_id: &str) -> Option<&SessionRecord> {
        self.records.get(client_id)
    }

    fn get_mut(&mut self, client_id: &str) -> Option<&mut SessionRecord> {
        self.records.get_mut(client_id)
    }

    fn contains(&self, client_id: &str) -> bool {
        self.records.contains_key(client_id)
    }

    fn insert(&mut self, record: SessionRecord) {
        self.records.insert(record.session.client_id.clone(), record);
    }

    fn remove(&mut self, client_id: &str) -> Option<SessionRecord> {
        self.records.remove(client_id)
    }

    fn client_ids(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// All live and disconnected-but-not-yet-expired sessions, keyed by client
/// id. A single client id maps to at most one record; a reconnecting
/// client either resumes its record (`clean_start == false`) or gets a
/// fresh one (§5.3).
pub struct SessionStore {
    backend: Box<dyn SessionBackend>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(Box::new(InMemorySessionBackend::default()))
    }

    #[must_use]
    pub fn with_backend(backend: Box<dyn SessionBackend>) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<&SessionRecord> {
        self.backend.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut SessionRecord> {
        self.backend.get_mut(client_id)
    }

    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.backend.contains(client_id)
    }

    pub fn insert(&mut self, record: SessionRecord) {
        self.backend.insert(record);
    }

    pub fn remove(&mut self, client_id: &str) -> Option<SessionRecord> {
        self.backend.remove(client_id)
    }

    /// Mark a session disconnected (starting its expiry clock) without
    /// discarding its queue/unack state.
    pub fn mark_disconnected(&mut self, client_id: &str, at: Instant) {
        if let Some(record) = self.backend.get_mut(client_id) {
            record.session.disconnected_at = Some(at);
        }
    }

    /// Every client id whose session has passed its expiry deadline,
    /// removed from the store so the reaper can also clear their
    /// subscriptions from the subscription trie.
    pub fn reap_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .backend
            .client_ids()
            .into_iter()
            .filter(|client_id| self.backend.get(client_id).is_some_and(|r| r.session.is_expired(now)))
            .collect();
        for client_id in &expired {
            self.backend.remove(client_id);
        }
        expired
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backend.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backend.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(client_id: &str, expiry_secs: u32) -> SessionRecord {
        SessionRecord::new(Session::new(client_id.to_string(), None, expiry_secs), 16, 1 << 16, None)
    }

    #[test]
    fn reap_expired_removes_only_past_deadline_sessions() {
        let mut store = SessionStore::new();
        store.insert(record("stays", u32::MAX));
        store.insert(record("goes", 0));
        let now = Instant::now();
        store.mark_disconnected("stays", now);
        store.mark_disconnected("goes", now);

        let reaped = store.reap_expired(now + Duration::from_secs(1));
        assert_eq!(reaped, vec!["goes".to_string()]);
        assert!(store.contains("stays"));
        assert!(!store.contains("goes"));
    }

    #[test]
    fn still_connected_sessions_are_never_reaped() {
        let mut store = SessionStore::new();
        store.insert(record("live", 0));
        let reaped = store.reap_expired(Instant::now() + Duration::from_secs(3600));
        assert!(reaped.is_empty());
    }

    /// A toy second backend, standing in for a disk/network-backed one,
    /// proving [`SessionStore`] doesn't hardcode [`InMemorySessionBackend`].
    #[derive(Default)]
    struct CountingBackend {
        inner: InMemorySessionBackend,
        inserts: usize,
    }

    impl SessionBackend for CountingBackend {
        fn get(&self, client_id: &str) -> Option<&SessionRecord> {
            self.inner.get(client_id)
        }

        fn get_mut(&mut self, client_id: &str) -> Option<&mut SessionRecord> {
            self.inner.get_mut(client_id)
        }

        fn contains(&self, client_id: &str) -> bool {
            self.inner.contains(client_id)
        }

        fn insert(&mut self, record: SessionRecord) {
            self.inserts += 1;
            self.inner.insert(record);
        }

        fn remove(&mut self, client_id: &str) -> Option<SessionRecord> {
            self.inner.remove(client_id)
        }

        fn client_ids(&self) -> Vec<String> {
            self.inner.client_ids()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[test]
    fn store_works_against_a_custom_backend() {
        let mut store = SessionStore::with_backend(Box::new(CountingBackend::default()));
        store.insert(record("a", u32::MAX));
        assert!(store.contains("a"));
        assert_eq!(store.len(), 1);
    }
}
