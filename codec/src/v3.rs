// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! MQTT 3.1 / 3.1.1 packet bodies. The fixed header is decoded separately
//! (see [`crate::header`]); every `decode` here starts at the variable
//! header and is handed a [`ByteArray`] already truncated to the packet's
//! `Remaining Length`.

use std::convert::TryFrom;

use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{PacketId, ProtocolVersion, QoS};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::utils::validate_utf8_string;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl ConnectPacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let protocol_name = ba.read_utf8_string()?;
        let protocol_level = ba.read_byte()?;
        let protocol_version = ProtocolVersion::try_from((protocol_name.as_str(), protocol_level))
            .map_err(|_| DecodeError::InvalidProtocolName)?;
        if protocol_version == ProtocolVersion::V5 {
            // v5 CONNECT bodies are decoded by `crate::v5::ConnectPacket`;
            // a caller that dispatches on the wire protocol level never
            // reaches this branch, but guard it anyway.
            return Err(DecodeError::InvalidProtocolLevel);
        }

        let flags = ba.read_byte()?;
        let username_flag = flags & 0b1000_0000 != 0;
        let password_flag = flags & 0b0100_0000 != 0;
        let will_retain = flags & 0b0010_0000 != 0;
        let will_qos = QoS::try_from((flags & 0b0001_1000) >> 3)?;
        let will_flag = flags & 0b0000_0100 != 0;
        let clean_session = flags & 0b0000_0010 != 0;
        if flags & 0b0000_0001 != 0 {
            return Err(DecodeError::InvalidClientId);
        }

        let keep_alive = ba.read_u16()?;
        let client_id = ba.read_utf8_string()?;
        if client_id.is_empty() && !clean_session {
            return Err(DecodeError::InvalidClientId);
        }

        let will = if will_flag {
            let topic = ba.read_utf8_string()?;
            validate_topic_name(&topic)?;
            let message = ba.read_binary()?;
            Some(Will {
                topic,
                message,
                qos: will_qos,
                retain: will_retain,
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
            protocol_version,
            clean_session,
            keep_alive,
            client_id,
            will,
            username,
            password,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        encode_utf8(buf, self.protocol_version.protocol_name());
        buf.push(self.protocol_version.level());

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
        if self.clean_session {
            flags |= 0b0000_0010;
        }
        buf.push(flags);

        buf.extend_from_slice(&self.keep_alive.to_be_bytes());
        encode_utf8(buf, &self.client_id);
        if let Some(will) = &self.will {
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
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::UnacceptableProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadUsernameOrPassword => 4,
            Self::NotAuthorized => 5,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUsernameOrPassword),
            5 => Ok(Self::NotAuthorized),
            _ => Err(DecodeError::InvalidPacketType),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAckPacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flags = ba.read_byte()?;
        let session_present = flags & 0b0000_0001 != 0;
        let return_code = ConnectReturnCode::from_byte(ba.read_byte()?)?;
        Ok(Self {
            session_present,
            return_code,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.push(u8::from(self.session_present));
        buf.push(self.return_code.to_byte());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<PacketId>,
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
        let payload = ba.read_bytes(ba.remaining())?.to_vec();
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        encode_utf8(buf, &self.topic);
        if let Some(id) = self.packet_id {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        buf.extend_from_slice(&self.payload);
        Ok(())
    }
}

macro_rules! packet_id_only {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: PacketId,
        }

        impl $name {
            pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
                Ok(Self {
                    packet_id: ba.read_u16()?,
                })
            }

            pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
                buf.extend_from_slice(&self.packet_id.to_be_bytes());
                Ok(())
            }
        }
    };
}

packet_id_only!(PubAckPacket);
packet_id_only!(PubRecPacket);
packet_id_only!(PubRelPacket);
packet_id_only!(PubCompPacket);
packet_id_only!(UnsubAckPacket);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: PacketId,
    pub filters: Vec<(String, QoS)>,
}

impl SubscribePacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_id = ba.read_u16()?;
        let mut filters = Vec::new();
        while ba.remaining() > 0 {
            let filter = ba.read_utf8_string()?;
            validate_topic_filter(&filter)?;
            let qos = QoS::try_from(ba.read_byte()? & 0b0000_0011)?;
            filters.push((filter, qos));
        }
        if filters.is_empty() {
            return Err(DecodeError::EmptyTopics);
        }
        Ok(Self { packet_id, filters })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        for (filter, qos) in &self.filters {
            encode_utf8(buf, filter);
            buf.push(*qos as u8);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckReturnCode {
    Success(QoS),
    Failure,
}

impl SubAckReturnCode {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Success(qos) => qos as u8,
            Self::Failure => 0x80,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        if byte == 0x80 {
            Ok(Self::Failure)
        } else {
            Ok(Self::Success(QoS::try_from(byte)?))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: PacketId,
    pub return_codes: Vec<SubAckReturnCode>,
}

impl SubAckPacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_id = ba.read_u16()?;
        let mut return_codes = Vec::new();
        while ba.remaining() > 0 {
            return_codes.push(SubAckReturnCode::from_byte(ba.read_byte()?)?);
        }
        Ok(Self {
            packet_id,
            return_codes,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        for rc in &self.return_codes {
            buf.push(rc.to_byte());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: PacketId,
    pub filters: Vec<String>,
}

impl UnsubscribePacket {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_id = ba.read_u16()?;
        let mut filters = Vec::new();
        while ba.remaining() > 0 {
            let filter = ba.read_utf8_string()?;
            validate_topic_filter(&filter)?;
            filters.push(filter);
        }
        if filters.is_empty() {
            return Err(DecodeError::EmptyTopics);
        }
        Ok(Self { packet_id, filters })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        for filter in &self.filters {
            encode_utf8(buf, filter);
        }
        Ok(())
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
    fn round_trips_connect_with_will_and_credentials() {
        let packet = ConnectPacket {
            protocol_version: ProtocolVersion::V311,
            clean_session: true,
            keep_alive: 30,
            client_id: "client-1".to_string(),
            will: Some(Will {
                topic: "last/will".to_string(),
                message: b"bye".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: false,
            }),
            username: Some("alice".to_string()),
            password: Some(b"secret".to_vec()),
        };
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn rejects_empty_client_id_without_clean_session() {
        let packet = ConnectPacket {
            protocol_version: ProtocolVersion::V311,
            clean_session: false,
            keep_alive: 30,
            client_id: String::new(),
            will: None,
            username: None,
            password: None,
        };
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert!(ConnectPacket::decode(&mut ba).is_err());
    }

    #[test]
    fn subscribe_requires_at_least_one_filter() {
        let buf = 1u16.to_be_bytes().to_vec();
        let mut ba = ByteArray::new(&buf);
        assert!(SubscribePacket::decode(&mut ba).is_err());
    }

    #[test]
    fn round_trips_publish_qos1() {
        let packet = PublishPacket {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "a/b".to_string(),
            packet_id: Some(42),
            payload: b"hello".to_vec(),
        };
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba, false, QoS::AtLeastOnce, true).unwrap();
        assert_eq!(decoded, packet);
    }
}
