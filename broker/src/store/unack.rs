// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Tracks QoS 2 packet ids that have been PUBRECed but not yet PUBCOMPed,
//! so a duplicate inbound PUBLISH (retransmitted because the client never
//! saw our PUBREC) can be recognized and not redelivered to subscribers a
//! second time.

use std::collections::HashSet;

use embermq_codec::header::PacketId;

#[derive(Debug, Default)]
pub struct UnackStore {
    ids: HashSet<PacketId>,
}

impl UnackStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per CONNECT. A clean start drops any ids left over from
    /// a previous connection; a resumed session keeps them so a pending
    /// QoS 2 exchange can finish.
    pub fn init(&mut self, clean_start: bool) {
        if clean_start {
            self.ids.clear();
        }
    }

    /// Record `id` as seen. Returns `true` if it was already present
    /// (meaning this PUBLISH is a duplicate).
    pub fn set(&mut self, id: PacketId) -> bool {
        !self.ids.insert(id)
    }

    pub fn remove(&mut self, id: PacketId) {
        self.ids.remove(&id);
    }

    #[must_use]
    pub fn contains(&self, id: PacketId) -> bool {
        self.ids.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_preexisting_id() {
        let mut store = UnackStore::new();
        assert!(!store.set(5));
        assert!(store.set(5));
    }

    #[test]
    fn clean_start_clears_prior_ids() {
        let mut store = UnackStore::new();
        store.set(5);
        store.init(true);
        assert!(!store.contains(5));
    }

    #[test]
    fn resumed_session_keeps_ids() {
        let mut store = UnackStore::new();
        store.set(5);
        store.init(false);
        assert!(store.contains(5));
    }
}
