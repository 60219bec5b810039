// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Bounded supply of in-use packet identifiers for one session. MQTT
//! reserves `0`; every other `u16` value is fair game as long as it isn't
//! already outstanding. The limiter is the back-pressure valve between the
//! outbound queue and the wire: a session can never have more inflight
//! QoS 1/2 deliveries than `capacity`.

use std::collections::HashSet;

use embermq_codec::header::PacketId;

pub struct PacketIdLimiter {
    in_use: HashSet<PacketId>,
    next: PacketId,
    capacity: usize,
    closed: bool,
}

impl PacketIdLimiter {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            in_use: HashSet::new(),
            next: 1,
            capacity: capacity.min(u16::MAX as usize),
            closed: false,
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use.len())
    }

    /// Claim one packet id, or `None` if the session is already holding
    /// `capacity` of them or the limiter has been closed.
    pub fn poll(&mut self) -> Option<PacketId> {
        if self.closed || self.in_use.len() >= self.capacity {
            return None;
        }
        let start = self.next;
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1).max(1);
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
            if self.next == start {
                return None;
            }
        }
    }

    /// Claim up to `count` ids at once, stopping early if the supply runs
    /// out; used to size a single `read()` call against the queue.
    pub fn poll_batch(&mut self, count: usize) -> Vec<PacketId> {
        let mut out = Vec::with_capacity(count.min(self.available()));
        while out.len() < count {
            match self.poll() {
                Some(id) => out.push(id),
                None => break,
            }
        }
        out
    }

    pub fn release(&mut self, id: PacketId) {
        self.in_use.remove(&id);
    }

    pub fn release_batch(&mut self, ids: &[PacketId]) {
        for id in ids {
            self.in_use.remove(id);
        }
    }

    /// Stops issuing new ids; used when a session is being torn down so a
    /// lingering reference can't hand out ids nobody will ever ack.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_hands_out_zero() {
        let mut limiter = PacketIdLimiter::new(10);
        for _ in 0..10 {
            assert_ne!(limiter.poll(), Some(0));
        }
    }

    #[test]
    fn exhausts_at_capacity() {
        let mut limiter = PacketIdLimiter::new(2);
        assert!(limiter.poll().is_some());
        assert!(limiter.poll().is_some());
        assert!(limiter.poll().is_none());
    }

    #[test]
    fn release_frees_capacity_for_reuse() {
        let mut limiter = PacketIdLimiter::new(1);
        let id = limiter.poll().unwrap();
        assert!(limiter.poll().is_none());
        limiter.release(id);
        assert!(limiter.poll().is_some());
    }

    #[test]
    fn closed_limiter_stops_polling() {
        let mut limiter = PacketIdLimiter::new(10);
        limiter.close();
        assert!(limiter.poll().is_none());
    }
}
