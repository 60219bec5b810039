// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! A wire-version-independent view of a published payload. The broker's
//! stores and delivery pump work exclusively in terms of [`Message`];
//! [`crate::packet`] is the only place that knows how to build one from, or
//! project it back onto, a v3 or v5 PUBLISH.

use crate::header::{PacketId, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<PacketId>,
    pub content_type: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub message_expiry_seconds: Option<u32>,
    pub payload_is_utf8: bool,
    pub response_topic: Option<String>,
    pub subscription_identifiers: Vec<u32>,
}

impl Message {
    /// A message built for re-delivery to one subscriber carries that
    /// subscriber's own packet id and subscription identifiers, but the
    /// same topic, payload and retain-carrying properties as the original
    /// publish.
    #[must_use]
    pub fn for_delivery(&self, packet_id: Option<PacketId>, qos: QoS, subscription_identifiers: Vec<u32>) -> Self {
        Self {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos,
            retain: self.retain,
            dup: false,
            packet_id,
            content_type: self.content_type.clone(),
            correlation_data: self.correlation_data.clone(),
            message_expiry_seconds: self.message_expiry_seconds,
            payload_is_utf8: self.payload_is_utf8,
            response_topic: self.response_topic.clone(),
            subscription_identifiers,
        }
    }
}
