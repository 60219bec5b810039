// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! MQTT 5 properties (§1 Non-goals: "no property-by-property re-emission
//! for every ack packet, only the subset used by QoS and retained-message
//! handling is required"). Decoding still has to tolerate every standard
//! property id so an unsupported one doesn't abort the whole packet; the
//! property table below carries enough type information to skip anything
//! this crate doesn't model.

use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::var_int::VarInt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PropertyValueType {
    Byte,
    TwoByteInt,
    FourByteInt,
    VarInt,
    Utf8String,
    Binary,
    Utf8StringPair,
}

fn value_type_for(id: u32) -> Option<PropertyValueType> {
    use PropertyValueType::{Binary, Byte, FourByteInt, TwoByteInt, Utf8String, Utf8StringPair};
    Some(match id {
        0x01 => Byte,                              // Payload Format Indicator
        0x02 => FourByteInt,                        // Message Expiry Interval
        0x03 => Utf8String,                         // Content Type
        0x08 => Utf8String,                         // Response Topic
        0x09 => Binary,                             // Correlation Data
        0x0B => PropertyValueType::VarInt,          // Subscription Identifier
        0x11 => FourByteInt,                        // Session Expiry Interval
        0x12 => Utf8String,                         // Assigned Client Identifier
        0x13 => TwoByteInt,                         // Server Keep Alive
        0x15 => Utf8String,                         // Authentication Method
        0x16 => Binary,                             // Authentication Data
        0x17 => Byte,                               // Request Problem Information
        0x18 => FourByteInt,                        // Will Delay Interval
        0x19 => Byte,                               // Request Response Information
        0x1A => Utf8String,                         // Response Information
        0x1C => Utf8String,                         // Server Reference
        0x1F => Utf8String,                         // Reason String
        0x21 => TwoByteInt,                         // Receive Maximum
        0x22 => TwoByteInt,                         // Topic Alias Maximum
        0x23 => TwoByteInt,                         // Topic Alias
        0x24 => Byte,                               // Maximum QoS
        0x25 => Byte,                               // Retain Available
        0x26 => Utf8StringPair,                     // User Property
        0x27 => FourByteInt,                        // Maximum Packet Size
        0x28 => Byte,                               // Wildcard Subscription Available
        0x29 => Byte,                               // Subscription Identifier Available
        0x2A => Byte,                               // Shared Subscription Available
        _ => return None,
    })
}

/// The subset of MQTT 5 properties this broker actually acts on, across all
/// packet types that can carry properties. Fields not relevant to a given
/// packet type are simply left `None` when building one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

impl Properties {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = VarInt::decode(ba)?.value() as usize;
        let end_offset = ba.offset() + len;
        let mut props = Self::default();
        while ba.offset() < end_offset {
            let id = VarInt::decode(ba)?.value();
            let value_type =
                value_type_for(id).ok_or(DecodeError::InvalidPropertyId(id))?;
            match value_type {
                PropertyValueType::Byte => {
                    let v = ba.read_byte()?;
                    assign_byte(&mut props, id, v);
                }
                PropertyValueType::TwoByteInt => {
                    let v = ba.read_u16()?;
                    assign_u16(&mut props, id, v);
                }
                PropertyValueType::FourByteInt => {
                    let v = ba.read_u32()?;
                    assign_u32(&mut props, id, v);
                }
                PropertyValueType::VarInt => {
                    let v = VarInt::decode(ba)?.value();
                    if id == 0x0B {
                        props.subscription_identifiers.push(v);
                    }
                }
                PropertyValueType::Utf8String => {
                    let v = ba.read_utf8_string()?;
                    assign_string(&mut props, id, v);
                }
                PropertyValueType::Binary => {
                    let v = ba.read_binary()?;
                    if id == 0x09 {
                        props.correlation_data = Some(v);
                    }
                    // 0x16 AuthenticationData: accepted, not modeled further.
                }
                PropertyValueType::Utf8StringPair => {
                    let _key = ba.read_utf8_string()?;
                    let _value = ba.read_utf8_string()?;
                    // User properties are accepted on the wire but not
                    // surfaced; no QoS or retained-message behaviour
                    // depends on them (§1).
                }
            }
        }
        Ok(props)
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        let mut body = Vec::new();
        if let Some(v) = self.payload_format_indicator {
            encode_byte_prop(&mut body, 0x01, v);
        }
        if let Some(v) = self.message_expiry_interval {
            encode_u32_prop(&mut body, 0x02, v);
        }
        if let Some(v) = &self.content_type {
            encode_string_prop(&mut body, 0x03, v);
        }
        if let Some(v) = &self.response_topic {
            encode_string_prop(&mut body, 0x08, v);
        }
        if let Some(v) = &self.correlation_data {
            encode_binary_prop(&mut body, 0x09, v);
        }
        for id in &self.subscription_identifiers {
            VarInt::new(0x0B)?.encode(&mut body)?;
            VarInt::new(*id)?.encode(&mut body)?;
        }
        if let Some(v) = self.session_expiry_interval {
            encode_u32_prop(&mut body, 0x11, v);
        }
        if let Some(v) = &self.assigned_client_identifier {
            encode_string_prop(&mut body, 0x12, v);
        }
        if let Some(v) = self.server_keep_alive {
            encode_u16_prop(&mut body, 0x13, v);
        }
        if let Some(v) = self.will_delay_interval {
            encode_u32_prop(&mut body, 0x18, v);
        }
        if let Some(v) = &self.reason_string {
            encode_string_prop(&mut body, 0x1F, v);
        }
        if let Some(v) = self.receive_maximum {
            encode_u16_prop(&mut body, 0x21, v);
        }
        if let Some(v) = self.topic_alias_maximum {
            encode_u16_prop(&mut body, 0x22, v);
        }
        if let Some(v) = self.topic_alias {
            encode_u16_prop(&mut body, 0x23, v);
        }
        if let Some(v) = self.maximum_qos {
            encode_byte_prop(&mut body, 0x24, v);
        }
        if let Some(v) = self.retain_available {
            encode_byte_prop(&mut body, 0x25, v);
        }
        if let Some(v) = self.maximum_packet_size {
            encode_u32_prop(&mut body, 0x27, v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            encode_byte_prop(&mut body, 0x28, v);
        }
        if let Some(v) = self.subscription_identifier_available {
            encode_byte_prop(&mut body, 0x29, v);
        }
        if let Some(v) = self.shared_subscription_available {
            encode_byte_prop(&mut body, 0x2A, v);
        }

        VarInt::new(body.len() as u32)?.encode(buf)?;
        buf.extend_from_slice(&body);
        Ok(())
    }
}

fn encode_byte_prop(buf: &mut Vec<u8>, id: u32, v: u8) {
    let _ = VarInt::new(id).map(|vi| vi.encode(buf));
    buf.push(v);
}

fn encode_u16_prop(buf: &mut Vec<u8>, id: u32, v: u16) {
    let _ = VarInt::new(id).map(|vi| vi.encode(buf));
    buf.extend_from_slice(&v.to_be_bytes());
}

fn encode_u32_prop(buf: &mut Vec<u8>, id: u32, v: u32) {
    let _ = VarInt::new(id).map(|vi| vi.encode(buf));
    buf.extend_from_slice(&v.to_be_bytes());
}

fn encode_string_prop(buf: &mut Vec<u8>, id: u32, v: &str) {
    let _ = VarInt::new(id).map(|vi| vi.encode(buf));
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(v.len() as u16).to_be_bytes());
    buf.extend_from_slice(v.as_bytes());
}

fn encode_binary_prop(buf: &mut Vec<u8>, id: u32, v: &[u8]) {
    let _ = VarInt::new(id).map(|vi| vi.encode(buf));
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(v.len() as u16).to_be_bytes());
    buf.extend_from_slice(v);
}

fn assign_byte(props: &mut Properties, id: u32, v: u8) {
    match id {
        0x01 => props.payload_format_indicator = Some(v),
        0x17 => props.request_problem_information = Some(v),
        0x24 => props.maximum_qos = Some(v),
        0x25 => props.retain_available = Some(v),
        0x28 => props.wildcard_subscription_available = Some(v),
        0x29 => props.subscription_identifier_available = Some(v),
        0x2A => props.shared_subscription_available = Some(v),
        0x19 => {} // request response information: accepted, unused
        _ => {}
    }
}

fn assign_u16(props: &mut Properties, id: u32, v: u16) {
    match id {
        0x13 => props.server_keep_alive = Some(v),
        0x21 => props.receive_maximum = Some(v),
        0x22 => props.topic_alias_maximum = Some(v),
        0x23 => props.topic_alias = Some(v),
        _ => {}
    }
}

fn assign_u32(props: &mut Properties, id: u32, v: u32) {
    match id {
        0x02 => props.message_expiry_interval = Some(v),
        0x11 => props.session_expiry_interval = Some(v),
        0x18 => props.will_delay_interval = Some(v),
        0x27 => props.maximum_packet_size = Some(v),
        _ => {}
    }
}

fn assign_string(props: &mut Properties, id: u32, v: String) {
    match id {
        0x03 => props.content_type = Some(v),
        0x08 => props.response_topic = Some(v),
        0x12 => props.assigned_client_identifier = Some(v),
        0x15 => {} // authentication method: accepted, unused
        0x1A => {} // response information: accepted, unused
        0x1C => {} // server reference: accepted, unused
        0x1F => props.reason_string = Some(v),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_publish_relevant_properties() {
        let props = Properties {
            message_expiry_interval: Some(60),
            content_type: Some("text/plain".to_string()),
            correlation_data: Some(vec![1, 2, 3]),
            subscription_identifiers: vec![5, 9],
            ..Properties::default()
        };
        let mut buf = Vec::new();
        props.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = Properties::decode(&mut ba).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn skips_unmodeled_user_property() {
        let mut body = Vec::new();
        VarInt::new(0x26).unwrap().encode(&mut body).unwrap();
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(b"ok");
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(b"ok");
        let mut buf = Vec::new();
        VarInt::new(body.len() as u32).unwrap().encode(&mut buf).unwrap();
        buf.extend_from_slice(&body);

        let mut ba = ByteArray::new(&buf);
        let decoded = Properties::decode(&mut ba).unwrap();
        assert_eq!(decoded, Properties::default());
    }
}
