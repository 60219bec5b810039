// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Per-session outbound message queue: everything queued for a client that
//! hasn't been fully delivered and acknowledged yet. `current` splits the
//! queue in two: elements before it have already been read once (they
//! carry an assigned packet id and are waiting on a PUBACK/PUBREC/PUBCOMP),
//! elements at or after it have never been handed to the connection.
//!
//! The drop policy below keeps the queue bounded without ever silently
//! losing a QoS 1/2 message if a QoS 0 or expired candidate is available to
//! sacrifice instead.

use std::collections::VecDeque;
use std::time::Instant;

use embermq_codec::header::{PacketId, QoS};
use embermq_codec::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    QueueFull,
    ExpiredInflight,
    Expired,
    ExceedsMaxPacketSize,
}

/// Receives accounting and drop events from an [`OutboundQueue`]. Two
/// distinct calls happen on every drop: one carrying the signed change in
/// queue/inflight length, one carrying the reason, so a consumer that only
/// cares about gauge values never has to interpret error enums.
pub trait QueueNotifier: Send + Sync {
    fn notify_queue_len_delta(&self, delta: i64);
    fn notify_inflight_delta(&self, delta: i64);
    fn notify_dropped(&self, message: &Message, reason: DropReason);
}

pub struct NullNotifier;

impl QueueNotifier for NullNotifier {
    fn notify_queue_len_delta(&self, _delta: i64) {}
    fn notify_inflight_delta(&self, _delta: i64) {}
    fn notify_dropped(&self, _message: &Message, _reason: DropReason) {}
}

#[derive(Debug, Clone)]
pub struct Element {
    pub message: Message,
    pub expiry: Option<Instant>,
    /// Set once a QoS 2 PUBLISH this session sent has been PUBREC'd. A
    /// resend of this element (reconnect before the client's PUBCOMP)
    /// must carry a PUBREL, not a duplicate PUBLISH.
    pub awaiting_pubrel: bool,
}

impl Element {
    fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|e| e <= now)
    }
}

#[derive(Debug)]
pub enum QueueError {
    Closed,
    InflightNotDrained,
}

pub struct OutboundQueue {
    elements: VecDeque<Element>,
    /// Index of the first never-read element; `elements.len()` means
    /// everything has been read at least once.
    current: usize,
    inflight_drained: bool,
    closed: bool,
    max_len: usize,
    inflight_expiry: Option<std::time::Duration>,
    max_packet_size: u32,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(max_len: usize, inflight_expiry: Option<std::time::Duration>, max_packet_size: u32) -> Self {
        Self {
            elements: VecDeque::new(),
            current: 0,
            inflight_drained: false,
            closed: false,
            max_len,
            inflight_expiry,
            max_packet_size,
        }
    }

    /// Called once per CONNECT. A clean start discards any prior queue
    /// contents; a resumed session keeps them and simply resets the
    /// read-tracking cursor for the new network connection.
    pub fn init(&mut self, clean_start: bool) {
        if clean_start {
            self.elements.clear();
        }
        self.current = 0;
        self.inflight_drained = false;
        self.closed = false;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn remove_at(&mut self, idx: usize) -> Element {
        let removed = self.elements.remove(idx).expect("idx must be in range");
        if idx < self.current {
            self.current -= 1;
        }
        removed
    }

    /// Enqueue a freshly published message for this session, applying the
    /// drop policy if the queue is already at capacity.
    pub fn add(&mut self, message: Message, now: Instant, notifier: &dyn QueueNotifier) {
        let expiry = message
            .message_expiry_seconds
            .map(|secs| now + std::time::Duration::from_secs(u64::from(secs)));
        let incoming = Element {
            message,
            expiry,
            awaiting_pubrel: false,
        };

        if self.elements.len() < self.max_len {
            notifier.notify_queue_len_delta(1);
            self.push_incoming(incoming);
            return;
        }

        // 1. an already-inflight front element that has expired always
        //    goes first, freeing a slot without touching anything pending.
        if self.current > 0 {
            if let Some(front) = self.elements.front() {
                if front.is_expired(now) {
                    notifier.notify_inflight_delta(-1);
                    let dropped = self.remove_at(0);
                    notifier.notify_dropped(&dropped.message, DropReason::ExpiredInflight);
                    notifier.notify_queue_len_delta(1);
                    self.push_incoming(incoming);
                    return;
                }
            }
        }

        // 2. nothing left to read and nothing inflight to expire: the
        //    queue is entirely stuck waiting on acks, drop the incoming
        //    message outright.
        if self.inflight_drained && self.current >= self.elements.len() {
            notifier.notify_dropped(&incoming.message, DropReason::QueueFull);
            return;
        }

        // 3. scan the pending region for an expired entry (wins
        //    immediately) or the first QoS 0 candidate (kept as a
        //    fallback victim while the scan continues).
        let mut candidate: Option<usize> = None;
        for idx in self.current..self.elements.len() {
            let elem = &self.elements[idx];
            if elem.message.packet_id.is_none() && elem.is_expired(now) {
                notifier.notify_queue_len_delta(-1);
                let dropped = self.remove_at(idx);
                notifier.notify_dropped(&dropped.message, DropReason::Expired);
                notifier.notify_queue_len_delta(1);
                self.push_incoming(incoming);
                return;
            }
            if elem.message.packet_id.is_none() && elem.message.qos == QoS::AtMostOnce && candidate.is_none() {
                candidate = Some(idx);
            }
        }
        if let Some(idx) = candidate {
            notifier.notify_queue_len_delta(-1);
            let dropped = self.remove_at(idx);
            notifier.notify_dropped(&dropped.message, DropReason::QueueFull);
            notifier.notify_queue_len_delta(1);
            self.push_incoming(incoming);
            return;
        }

        if incoming.message.qos == QoS::AtMostOnce {
            notifier.notify_dropped(&incoming.message, DropReason::QueueFull);
            return;
        }

        if self.inflight_drained {
            // every remaining queued message outranks the incoming one in
            // age; sacrifice the oldest pending entry to make room.
            notifier.notify_queue_len_delta(-1);
            let dropped = self.remove_at(self.current);
            notifier.notify_dropped(&dropped.message, DropReason::QueueFull);
            notifier.notify_queue_len_delta(1);
            self.push_incoming(incoming);
            return;
        }

        // everything in the queue is still inflight and nothing can be
        // sacrificed without breaking an ordering guarantee: drop incoming.
        notifier.notify_dropped(&incoming.message, DropReason::QueueFull);
    }

    fn push_incoming(&mut self, elem: Element) {
        self.elements.push_back(elem);
    }

    /// Drain already-assigned (inflight) elements starting at the cursor,
    /// up to `max` of them, without handing out any new packet ids. Must
    /// be called once after [`Self::init`] before [`Self::read`] will do
    /// anything but error.
    pub fn read_inflight(&mut self, max: usize, now: Instant) -> Vec<Element> {
        if self.elements.is_empty() || self.current >= self.elements.len() {
            self.inflight_drained = true;
            return Vec::new();
        }
        let mut out = Vec::new();
        let limit = max.min(self.elements.len() - self.current);
        for _ in 0..limit {
            let Some(elem) = self.elements.get(self.current) else {
                break;
            };
            if elem.message.packet_id.is_none() {
                self.inflight_drained = true;
                break;
            }
            let mut elem = elem.clone();
            if let Some(expiry) = self.inflight_expiry {
                elem.expiry = Some(now + expiry);
            }
            out.push(elem);
            self.current += 1;
        }
        out
    }

    /// Assign packet ids to up to `ids.len()` pending elements and hand
    /// them out for delivery. QoS 0 elements are removed immediately since
    /// they need no acknowledgement; QoS 1/2 elements stay in the queue,
    /// now inflight, until [`Self::remove`] acks them.
    pub fn read(
        &mut self,
        ids: &[PacketId],
        now: Instant,
        notifier: &dyn QueueNotifier,
    ) -> Result<Vec<Element>, QueueError> {
        if !self.inflight_drained {
            return Err(QueueError::InflightNotDrained);
        }
        if self.closed {
            return Err(QueueError::Closed);
        }

        let mut out = Vec::new();
        let mut queue_delta = 0i64;
        let mut inflight_delta = 0i64;
        let mut next_id = 0usize;

        while out.len() < ids.len() && self.current < self.elements.len() {
            let elem = &self.elements[self.current];
            if elem.is_expired(now) {
                let dropped = self.remove_at(self.current);
                notifier.notify_dropped(&dropped.message, DropReason::Expired);
                queue_delta -= 1;
                continue;
            }
            if approx_wire_size(&elem.message) > self.max_packet_size {
                let dropped = self.remove_at(self.current);
                notifier.notify_dropped(&dropped.message, DropReason::ExceedsMaxPacketSize);
                queue_delta -= 1;
                continue;
            }

            if elem.message.qos == QoS::AtMostOnce {
                let dropped = self.remove_at(self.current);
                queue_delta -= 1;
                out.push(dropped);
            } else {
                let mut elem = self.elements[self.current].clone();
                elem.message.packet_id = Some(ids[next_id]);
                next_id += 1;
                if let Some(expiry) = self.inflight_expiry {
                    elem.expiry = Some(now + expiry);
                }
                self.elements[self.current] = elem.clone();
                inflight_delta += 1;
                self.current += 1;
                out.push(elem);
            }
        }

        notifier.notify_queue_len_delta(queue_delta);
        notifier.notify_inflight_delta(inflight_delta);
        Ok(out)
    }

    /// Ack an inflight element by packet id. Only the already-sent region
    /// (before the cursor) is searched, matching the invariant that a
    /// never-delivered element cannot be acked.
    pub fn remove(&mut self, pid: PacketId, notifier: &dyn QueueNotifier) -> bool {
        for idx in 0..self.current.min(self.elements.len()) {
            if self.elements[idx].message.packet_id == Some(pid) {
                self.remove_at(idx);
                notifier.notify_queue_len_delta(-1);
                notifier.notify_inflight_delta(-1);
                return true;
            }
        }
        false
    }

    /// Mark an inflight QoS 2 element as awaiting PUBCOMP: the client
    /// PUBREC'd it, so a resend from here on must be a PUBREL rather than
    /// a duplicate PUBLISH. Only the inflight region is eligible, same as
    /// [`Self::remove`]. Returns whether a matching element was found.
    pub fn mark_pubrel_pending(&mut self, pid: PacketId) -> bool {
        for idx in 0..self.current.min(self.elements.len()) {
            if self.elements[idx].message.packet_id == Some(pid) {
                self.elements[idx].awaiting_pubrel = true;
                return true;
            }
        }
        false
    }
}

fn approx_wire_size(message: &Message) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let size = (message.topic.len() + message.payload.len() + 8) as u32;
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(qos: QoS) -> Message {
        Message {
            topic: "t".to_string(),
            payload: vec![1, 2, 3],
            qos,
            retain: false,
            dup: false,
            packet_id: None,
            content_type: None,
            correlation_data: None,
            message_expiry_seconds: None,
            payload_is_utf8: false,
            response_topic: None,
            subscription_identifiers: Vec::new(),
        }
    }

    #[test]
    fn drops_qos0_candidate_before_incoming_qos1() {
        let mut q = OutboundQueue::new(2, None, 1 << 20);
        let n = NullNotifier;
        let now = Instant::now();
        q.add(msg(QoS::AtMostOnce), now, &n);
        q.add(msg(QoS::AtLeastOnce), now, &n);
        assert_eq!(q.len(), 2);
        q.add(msg(QoS::AtLeastOnce), now, &n);
        assert_eq!(q.len(), 2);
        assert!(q.elements.iter().all(|e| e.message.qos == QoS::AtLeastOnce));
    }

    #[test]
    fn drops_incoming_qos0_when_queue_full_of_qos1() {
        let mut q = OutboundQueue::new(1, None, 1 << 20);
        let n = NullNotifier;
        let now = Instant::now();
        q.add(msg(QoS::AtLeastOnce), now, &n);
        q.add(msg(QoS::AtMostOnce), now, &n);
        assert_eq!(q.len(), 1);
        assert_eq!(q.elements[0].message.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn read_assigns_ids_and_keeps_qos1_inflight() {
        let mut q = OutboundQueue::new(10, None, 1 << 20);
        let n = NullNotifier;
        let now = Instant::now();
        q.add(msg(QoS::AtLeastOnce), now, &n);
        q.read_inflight(10, now);
        let ids = vec![5];
        let out = q.read(&ids, now, &n).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.packet_id, Some(5));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn read_drops_qos0_immediately() {
        let mut q = OutboundQueue::new(10, None, 1 << 20);
        let n = NullNotifier;
        let now = Instant::now();
        q.add(msg(QoS::AtMostOnce), now, &n);
        q.read_inflight(10, now);
        let ids = vec![1];
        let out = q.read(&ids, now, &n).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn remove_only_acks_inflight_region() {
        let mut q = OutboundQueue::new(10, None, 1 << 20);
        let n = NullNotifier;
        let now = Instant::now();
        q.add(msg(QoS::AtLeastOnce), now, &n);
        q.read_inflight(10, now);
        assert!(!q.remove(9, &n));
        let ids = vec![9];
        q.read(&ids, now, &n).unwrap();
        assert!(q.remove(9, &n));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn mark_pubrel_pending_only_affects_inflight_region() {
        let mut q = OutboundQueue::new(10, None, 1 << 20);
        let n = NullNotifier;
        let now = Instant::now();
        q.add(msg(QoS::ExactlyOnce), now, &n);
        assert!(!q.mark_pubrel_pending(9));
        q.read_inflight(10, now);
        let ids = vec![9];
        let out = q.read(&ids, now, &n).unwrap();
        assert_eq!(out.len(), 1);
        assert!(q.mark_pubrel_pending(9));
        let resend = q.read_inflight(10, now);
        assert_eq!(resend.len(), 1);
        assert!(resend[0].awaiting_pubrel);
    }
}
