// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Session state kept across a connection's lifetime and, for sessions
//! with a non-zero expiry interval, across reconnects.

use std::time::{Duration, Instant};

use embermq_codec::header::{ProtocolVersion, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: u32,
}

/// A client's durable session state. Kept in the session store after a
/// disconnect until [`Session::is_expired`] says otherwise, at which point
/// the reaper discards it along with its queue and unack state.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: String,
    pub will: Option<Will>,
    pub connected_at: Instant,
    pub expiry_interval_secs: u32,
    /// Set once the connection drops; `None` while the client is attached.
    pub disconnected_at: Option<Instant>,
    /// The version negotiated by this client's CONNECT, used to encode
    /// whatever the delivery pump sends it even while it's disconnected
    /// and nothing is being encoded yet.
    pub protocol_version: ProtocolVersion,
}

impl Session {
    #[must_use]
    pub fn new(client_id: String, will: Option<Will>, expiry_interval_secs: u32) -> Self {
        Self {
            client_id,
            will,
            connected_at: Instant::now(),
            expiry_interval_secs,
            disconnected_at: None,
            protocol_version: ProtocolVersion::V311,
        }
    }

    /// A session with expiry interval `0` expires the instant the network
    /// connection is lost; `u32::MAX` never expires.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        let Some(disconnected_at) = self.disconnected_at else {
            return false;
        };
        if self.expiry_interval_secs == u32::MAX {
            return false;
        }
        disconnected_at + Duration::from_secs(u64::from(self.expiry_interval_secs)) <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_expiry_is_expired_as_soon_as_disconnected() {
        let mut session = Session::new("c1".to_string(), None, 0);
        session.disconnected_at = Some(Instant::now());
        assert!(session.is_expired(Instant::now()));
    }

    #[test]
    fn still_connected_session_never_expires() {
        let session = Session::new("c1".to_string(), None, 0);
        assert!(!session.is_expired(Instant::now()));
    }

    #[test]
    fn nonzero_expiry_survives_until_deadline() {
        let mut session = Session::new("c1".to_string(), None, 3600);
        let now = Instant::now();
        session.disconnected_at = Some(now);
        assert!(!session.is_expired(now + Duration::from_secs(10)));
    }
}
