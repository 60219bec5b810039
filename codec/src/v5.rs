// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! MQTT 5 packet bodies. Property handling is delegated to
//! [`crate::properties::Properties`]; reason codes follow the subset this
//! broker actually distinguishes (§1 Non-goals excludes full per-ack
//! property re-emission, not reason codes themselves).

use std::convert::TryFrom;

use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{PacketId, QoS};
use crate::properties::Properties;
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::var_int::VarInt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub properties: Properties,
}

impl ConnectPacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let _protocol_name = ba.read_utf8_string()?;
        let _protocol_level = ba.read_byte()?;

        let flags = ba.read_byte()?;
        let username_flag = flags & 0b1000_0000 != 0;
        let password_flag = flags & 0b0100_0000 != 0;
        let will_retain = flags & 0b0010_0000 != 0;
        let will_qos = QoS::try_from((flags & 0b0001_1000) >> 3)?;
        let will_flag = flags & 0b0000_0100 != 0;
        let clean_start = flags & 0b0000_0010 != 0;

        let keep_alive = ba.read_u16()?;
        let properties = Properties::decode(ba)?;
        let client_id = ba.read_utf8_string()?;
        if client_id.is_empty() && !clean_start {
            return Err(DecodeError::InvalidClientId);
        }

        let will = if will_flag {
            let will_properties = Properties::decode(ba)?;
            let topic = ba.read_utf8_string()?;
            validate_topic_name(&topic)?;
            let message = ba.read_binary()?;
            Some(Will {
                topic,
                message,
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(ba.read_utf8_string()?)
        } else {
            None
        };
        let password = if password_flag {
            Some(ba.read_binary()?)
        } else {
            None
        };

        Ok(Self {
            clean_start,
            keep_alive,
            client_id,
            will,
            username,
            password,
            properties,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        encode_utf8(buf, "MQTT");
        buf.push(5);

        let mut flags = 0u8;
        if self.username.is_some() {
            flags |= 0b1000_0000;
        }
        if self.password.is_some() {
            flags |= 0b0100_0000;
        }
        if let Some(will) = &self.will {
            if will.retain {
                flags |= 0b0010_0000;
            }
            flags |= (will.qos as u8) << 3;
            flags |= 0b0000_0100;
        }
        if self.clean_start {
            flags |= 0b0000_0010;
        }
        buf.push(flags);

        buf.extend_from_slice(&self.keep_alive.to_be_bytes());
        self.properties.encode(buf)?;
        encode_utf8(buf, &self.client_id);
        if let Some(will) = &self.will {
            will.properties.encode(buf)?;
            encode_utf8(buf, &will.topic);
            encode_binary(buf, &will.message);
        }
        if let Some(username) = &self.username {
            encode_utf8(buf, username);
        }
        if let Some(password) = &self.password {
            encode_binary(buf, password);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    Success,
    NormalDisconnection,
    GrantedQoS0,
    GrantedQoS1,
    GrantedQoS2,
    DisconnectWithWillMessage,
    NoMatchingSubscribers,
    UnspecifiedError,
    MalformedPacket,
    ProtocolError,
    NotAuthorized,
    ServerBusy,
    BadAuthenticationMethod,
    TopicFilterInvalid,
    TopicNameInvalid,
    PacketIdentifierInUse,
    PacketIdentifierNotFound,
    PacketTooLarge,
    QuotaExceeded,
    PayloadFormatInvalid,
    RetainNotSupported,
    QoSNotSupported,
    UseAnotherServer,
    ServerMoved,
    SharedSubscriptionsNotSupported,
    ConnectionRateExceeded,
    SubscriptionIdentifiersNotSupported,
    WildcardSubscriptionsNotSupported,
    UnsupportedProtocolVersion,
    ClientIdentifierNotValid,
    BadUsernameOrPassword,
    ServerUnavailable,
}

impl ReasonCode {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Success | Self::NormalDisconnection | Self::GrantedQoS0 => 0x00,
            Self::GrantedQoS1 => 0x01,
            Self::GrantedQoS2 => 0x02,
            Self::DisconnectWithWillMessage => 0x04,
            Self::NoMatchingSubscribers => 0x10,
            Self::UnspecifiedError => 0x80,
            Self::MalformedPacket => 0x81,
            Self::ProtocolError => 0x82,
            Self::NotAuthorized => 0x87,
            Self::ServerUnavailable => 0x88,
            Self::ServerBusy => 0x89,
            Self::BadUsernameOrPassword => 0x8A,
            Self::BadAuthenticationMethod => 0x8C,
            Self::TopicNameInvalid => 0x90,
            Self::PacketIdentifierInUse => 0x91,
            Self::PacketIdentifierNotFound => 0x92,
            Self::PacketTooLarge => 0x95,
            Self::QuotaExceeded => 0x97,
            Self::PayloadFormatInvalid => 0x99,
            Self::RetainNotSupported => 0x9A,
            Self::QoSNotSupported => 0x9B,
            Self::UseAnotherServer => 0x9C,
            Self::ServerMoved => 0x9D,
            Self::SharedSubscriptionsNotSupported => 0x9E,
            Self::ConnectionRateExceeded => 0x9F,
            Self::TopicFilterInvalid => 0x8F,
            Self::SubscriptionIdentifiersNotSupported => 0xA1,
            Self::WildcardSubscriptionsNotSupported => 0xA2,
            Self::UnsupportedProtocolVersion => 0x84,
            Self::ClientIdentifierNotValid => 0x85,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        Ok(match byte {
            0x00 => Self::Success,
            0x01 => Self::GrantedQoS1,
            0x02 => Self::GrantedQoS2,
            0x04 => Self::DisconnectWithWillMessage,
            0x10 => Self::NoMatchingSubscribers,
            0x80 => Self::UnspecifiedError,
            0x81 => Self::MalformedPacket,
            0x82 => Self::ProtocolError,
            0x84 => Self::UnsupportedProtocolVersion,
            0x85 => Self::ClientIdentifierNotValid,
            0x87 => Self::NotAuthorized,
            0x88 => Self::ServerUnavailable,
            0x89 => Self::ServerBusy,
            0x8A => Self::BadUsernameOrPassword,
            0x8C => Self::BadAuthenticationMethod,
            0x8F => Self::TopicFilterInvalid,
            0x90 => Self::TopicNameInvalid,
            0x91 => Self::PacketIdentifierInUse,
            0x92 => Self::PacketIdentifierNotFound,
            0x95 => Self::PacketTooLarge,
            0x97 => Self::QuotaExceeded,
            0x99 => Self::PayloadFormatInvalid,
            0x9A => Self::RetainNotSupported,
            0x9B => Self::QoSNotSupported,
            0x9C => Self::UseAnotherServer,
            0x9D => Self::ServerMoved,
            0x9E => Self::SharedSubscriptionsNotSupported,
            0x9F => Self::ConnectionRateExceeded,
            0xA1 => Self::SubscriptionIdentifiersNotSupported,
            0xA2 => Self::WildcardSubscriptionsNotSupported,
            _ => return Err(DecodeError::InvalidPacketType),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl ConnAckPacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flags = ba.read_byte()?;
        let session_present = flags & 0b0000_0001 != 0;
        let reason_code = ReasonCode::from_byte(ba.read_byte()?)?;
        let properties = Properties::decode(ba)?;
        Ok(Self {
            session_present,
            reason_code,
            properties,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.push(u8::from(self.session_present));
        buf.push(self.reason_code.to_byte());
        self.properties.encode(buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<PacketId>,
    pub properties: Properties,
    pub payload: Vec<u8>,
}

impl PublishPacket {
    pub fn decode(ba: &mut ByteArray, dup: bool, qos: QoS, retain: bool) -> Result<Self, DecodeError> {
        let topic = ba.read_utf8_string()?;
        validate_topic_name(&topic)?;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(ba.read_u16()?)
        };
        let properties = Properties::decode(ba)?;
        let payload = ba.read_bytes(ba.remaining())?.to_vec();
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            payload,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        encode_utf8(buf, &self.topic);
        if let Some(id) = self.packet_id {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        self.properties.encode(buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// PUBACK/PUBREC/PUBREL/PUBCOMP share this shape in v5: a packet id, and
/// (only when the remaining length is long enough to hold it) a reason
/// code and properties. A bare 2-byte body means "success, no properties".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub packet_id: PacketId,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl AckPacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_id = ba.read_u16()?;
        if ba.remaining() == 0 {
            return Ok(Self {
                packet_id,
                reason_code: ReasonCode::Success,
                properties: Properties::default(),
            });
        }
        let reason_code = ReasonCode::from_byte(ba.read_byte()?)?;
        let properties = if ba.remaining() == 0 {
            Properties::default()
        } else {
            Properties::decode(ba)?
        };
        Ok(Self {
            packet_id,
            reason_code,
            properties,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        if self.reason_code.to_byte() == 0 && self.properties == Properties::default() {
            return Ok(());
        }
        buf.push(self.reason_code.to_byte());
        self.properties.encode(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainHandling {
    SendAtSubscribeTime,
    SendIfNewSubscription,
    DoNotSend,
}

impl SubscriptionOptions {
    fn decode(byte: u8) -> Result<Self, DecodeError> {
        let qos = QoS::try_from(byte & 0b0000_0011)?;
        let no_local = byte & 0b0000_0100 != 0;
        let retain_as_published = byte & 0b0000_1000 != 0;
        let retain_handling = match (byte & 0b0011_0000) >> 4 {
            0 => RetainHandling::SendAtSubscribeTime,
            1 => RetainHandling::SendIfNewSubscription,
            2 => RetainHandling::DoNotSend,
            _ => return Err(DecodeError::InvalidQoS),
        };
        Ok(Self {
            qos,
            no_local,
            retain_as_published,
            retain_handling,
        })
    }

    const fn to_byte(self) -> u8 {
        let retain_handling = match self.retain_handling {
            RetainHandling::SendAtSubscribeTime => 0,
            RetainHandling::SendIfNewSubscription => 1,
            RetainHandling::DoNotSend => 2,
        };
        let no_local = if self.no_local { 1 } else { 0 };
        let retain_as_published = if self.retain_as_published { 1 } else { 0 };
        (self.qos as u8) | (no_local << 2) | (retain_as_published << 3) | (retain_handling << 4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: PacketId,
    pub properties: Properties,
    pub filters: Vec<(String, SubscriptionOptions)>,
}

impl SubscribePacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_id = ba.read_u16()?;
        let properties = Properties::decode(ba)?;
        let mut filters = Vec::new();
        while ba.remaining() > 0 {
            let filter = ba.read_utf8_string()?;
            validate_topic_filter(&filter)?;
            let options = SubscriptionOptions::decode(ba.read_byte()?)?;
            filters.push((filter, options));
        }
        if filters.is_empty() {
            return Err(DecodeError::EmptyTopics);
        }
        Ok(Self {
            packet_id,
            properties,
            filters,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        self.properties.encode(buf)?;
        for (filter, options) in &self.filters {
            encode_utf8(buf, filter);
            buf.push(options.to_byte());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: PacketId,
    pub properties: Properties,
    pub reason_codes: Vec<ReasonCode>,
}

impl SubAckPacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_id = ba.read_u16()?;
        let properties = Properties::decode(ba)?;
        let mut reason_codes = Vec::new();
        while ba.remaining() > 0 {
            reason_codes.push(ReasonCode::from_byte(ba.read_byte()?)?);
        }
        Ok(Self {
            packet_id,
            properties,
            reason_codes,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        self.properties.encode(buf)?;
        for rc in &self.reason_codes {
            buf.push(rc.to_byte());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: PacketId,
    pub properties: Properties,
    pub filters: Vec<String>,
}

impl UnsubscribePacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_id = ba.read_u16()?;
        let properties = Properties::decode(ba)?;
        let mut filters = Vec::new();
        while ba.remaining() > 0 {
            let filter = ba.read_utf8_string()?;
            validate_topic_filter(&filter)?;
            filters.push(filter);
        }
        if filters.is_empty() {
            return Err(DecodeError::EmptyTopics);
        }
        Ok(Self {
            packet_id,
            properties,
            filters,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        self.properties.encode(buf)?;
        for filter in &self.filters {
            encode_utf8(buf, filter);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: PacketId,
    pub properties: Properties,
    pub reason_codes: Vec<ReasonCode>,
}

impl UnsubAckPacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_id = ba.read_u16()?;
        let properties = Properties::decode(ba)?;
        let mut reason_codes = Vec::new();
        while ba.remaining() > 0 {
            reason_codes.push(ReasonCode::from_byte(ba.read_byte()?)?);
        }
        Ok(Self {
            packet_id,
            properties,
            reason_codes,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        self.properties.encode(buf)?;
        for rc in &self.reason_codes {
            buf.push(rc.to_byte());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl DisconnectPacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        if ba.remaining() == 0 {
            return Ok(Self {
                reason_code: ReasonCode::NormalDisconnection,
                properties: Properties::default(),
            });
        }
        let reason_code = ReasonCode::from_byte(ba.read_byte()?)?;
        let properties = if ba.remaining() == 0 {
            Properties::default()
        } else {
            Properties::decode(ba)?
        };
        Ok(Self {
            reason_code,
            properties,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        if self.reason_code.to_byte() == 0 && self.properties == Properties::default() {
            return Ok(());
        }
        buf.push(self.reason_code.to_byte());
        self.properties.encode(buf)
    }
}

fn encode_utf8(buf: &mut Vec<u8>, s: &str) {
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn encode_binary(buf: &mut Vec<u8>, data: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_connect_with_will_properties() {
        let packet = ConnectPacket {
            clean_start: true,
            keep_alive: 30,
            client_id: "c1".to_string(),
            will: Some(Will {
                topic: "a/b".to_string(),
                message: b"bye".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: false,
                properties: Properties {
                    will_delay_interval: Some(5),
                    ..Properties::default()
                },
            }),
            username: None,
            password: None,
            properties: Properties {
                session_expiry_interval: Some(3600),
                ..Properties::default()
            },
        };
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn bare_ack_omits_reason_and_properties() {
        let packet = AckPacket {
            packet_id: 7,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf, 7u16.to_be_bytes());
        let mut ba = ByteArray::new(&buf);
        let decoded = AckPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn subscription_options_round_trip() {
        let opts = SubscriptionOptions {
            qos: QoS::ExactlyOnce,
            no_local: true,
            retain_as_published: true,
            retain_handling: RetainHandling::DoNotSend,
        };
        assert_eq!(SubscriptionOptions::decode(opts.to_byte()).unwrap(), opts);
    }
}
