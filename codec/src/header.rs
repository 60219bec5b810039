// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::byte_array::ByteArray;
use crate::error::DecodeError;
use crate::var_int::VarInt;

/// `MQIsdp` level 3, `MQTT` level 4, `MQTT` level 5 (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    V31,
    V311,
    V5,
}

impl ProtocolVersion {
    #[must_use]
    pub const fn protocol_name(self) -> &'static str {
        match self {
            Self::V31 => "MQIsdp",
            Self::V311 | Self::V5 => "MQTT",
        }
    }

    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::V31 => 3,
            Self::V311 => 4,
            Self::V5 => 5,
        }
    }
}

impl TryFrom<(&str, u8)> for ProtocolVersion {
    type Error = DecodeError;

    fn try_from((name, level): (&str, u8)) -> Result<Self, Self::Error> {
        match (name, level) {
            ("MQIsdp", 3) => Ok(Self::V31),
            ("MQTT", 4) => Ok(Self::V311),
            ("MQTT", 5) => Ok(Self::V5),
            _ => Err(DecodeError::InvalidProtocolLevel),
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[must_use]
    pub const fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

pub type PacketId = u16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketTypeCode {
    Connect,
    ConnAck,
    Publish { dup: bool, qos: QoS, retain: bool },
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

impl PacketTypeCode {
    #[must_use]
    pub const fn type_bits(self) -> u8 {
        match self {
            Self::Connect => 1,
            Self::ConnAck => 2,
            Self::Publish { .. } => 3,
            Self::PubAck => 4,
            Self::PubRec => 5,
            Self::PubRel => 6,
            Self::PubComp => 7,
            Self::Subscribe => 8,
            Self::SubAck => 9,
            Self::Unsubscribe => 10,
            Self::UnsubAck => 11,
            Self::PingReq => 12,
            Self::PingResp => 13,
            Self::Disconnect => 14,
        }
    }

    const fn flag_bits(self) -> u8 {
        match self {
            Self::Publish { dup, qos, retain } => {
                let dup = if dup { 0b1000 } else { 0 };
                let qos = (qos as u8) << 1;
                let retain = if retain { 1 } else { 0 };
                dup | qos | retain
            }
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => 0b0010,
            _ => 0,
        }
    }

    #[must_use]
    pub const fn to_byte(self) -> u8 {
        (self.type_bits() << 4) | self.flag_bits()
    }

    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        let type_bits = (byte & 0xF0) >> 4;
        let flags = byte & 0x0F;
        match type_bits {
            1 if flags == 0 => Ok(Self::Connect),
            2 if flags == 0 => Ok(Self::ConnAck),
            3 => {
                let dup = flags & 0b1000 != 0;
                let retain = flags & 0b0001 != 0;
                let qos = QoS::try_from((flags & 0b0110) >> 1)?;
                Ok(Self::Publish { dup, qos, retain })
            }
            4 if flags == 0 => Ok(Self::PubAck),
            5 if flags == 0 => Ok(Self::PubRec),
            6 if flags == 0b0010 => Ok(Self::PubRel),
            7 if flags == 0 => Ok(Self::PubComp),
            8 if flags == 0b0010 => Ok(Self::Subscribe),
            9 if flags == 0 => Ok(Self::SubAck),
            10 if flags == 0b0010 => Ok(Self::Unsubscribe),
            11 if flags == 0 => Ok(Self::UnsubAck),
            12 if flags == 0 => Ok(Self::PingReq),
            13 if flags == 0 => Ok(Self::PingResp),
            14 if flags == 0 => Ok(Self::Disconnect),
            1..=14 => Err(DecodeError::InvalidPacketFlags),
            _ => Err(DecodeError::InvalidPacketType),
        }
    }
}

/// The two-to-five byte header shared by every control packet: one type
/// byte, followed by a 1-4 byte variable-length "Remaining Length".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketTypeCode,
    pub remaining_length: u32,
}

impl FixedHeader {
    pub fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let byte = ba.read_byte()?;
        let packet_type = PacketTypeCode::from_byte(byte)?;
        let remaining_length = VarInt::decode(ba)?.value();
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    pub fn encode(self, buf: &mut Vec<u8>) -> Result<(), crate::error::EncodeError> {
        buf.push(self.packet_type.to_byte());
        VarInt::new(self.remaining_length)?.encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_publish_flags() {
        let pt = PacketTypeCode::Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: true,
        };
        let byte = pt.to_byte();
        assert_eq!(PacketTypeCode::from_byte(byte).unwrap(), pt);
    }

    #[test]
    fn rejects_reserved_flags_on_connect() {
        assert!(PacketTypeCode::from_byte(0b0001_0001).is_err());
    }

    #[test]
    fn qos_min_picks_lower() {
        assert_eq!(QoS::AtLeastOnce.min(QoS::ExactlyOnce), QoS::AtLeastOnce);
    }
}
