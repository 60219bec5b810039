// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! The top-level [`Packet`] enum and the version-aware [`Reader`] that
//! turns a byte stream into a sequence of them. Connect/ack/subscribe
//! bodies are unified across MQTT 3.1/3.1.1/5 here so the engine in the
//! broker crate never has to match on [`ProtocolVersion`] itself; only this
//! module and its `v3`/`v5` siblings do.

use std::convert::TryFrom;

use crate::byte_array::ByteArray;
use crate::error::DecodeError;
use crate::header::{FixedHeader, PacketId, PacketTypeCode, ProtocolVersion, QoS};
use crate::message::Message;
use crate::properties::Properties;
use crate::v3;
use crate::v5;
use crate::var_int::MAX_REMAINING_LENGTH;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectBody {
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
}

/// Why a CONNECT was accepted or refused, independent of wire version; see
/// [`encode_connack`] for how each variant maps onto the v3.1.1 return code
/// or v5 reason code actually sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    BadUserNameOrPassword,
    NotAuthorized,
    ServerUnavailable,
}

impl ConnectReason {
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckBody {
    pub session_present: bool,
    pub reason: ConnectReason,
    pub session_expiry_interval: Option<u32>,
}

/// Shared shape of PUBACK/PUBREC/PUBREL/PUBCOMP once a reason code is
/// reduced to "worked" or "didn't" — the broker's ack state machine only
/// ever branches on that, never on the fine-grained v5 code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBody {
    pub packet_id: PacketId,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeBody {
    pub packet_id: PacketId,
    pub filters: Vec<SubscribeFilter>,
    pub subscription_identifier: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub filter: String,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub send_retained: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckBody {
    pub packet_id: PacketId,
    pub results: Vec<Option<QoS>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeBody {
    pub packet_id: PacketId,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAckBody {
    pub packet_id: PacketId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectBody {
    pub send_will: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectBody),
    ConnAck(ConnAckBody),
    Publish(Message),
    PubAck(AckBody),
    PubRec(AckBody),
    PubRel(AckBody),
    PubComp(AckBody),
    Subscribe(SubscribeBody),
    SubAck(SubAckBody),
    Unsubscribe(UnsubscribeBody),
    UnsubAck(UnsubAckBody),
    PingReq,
    PingResp,
    Disconnect(DisconnectBody),
}

fn message_from_v3(p: v3::PublishPacket) -> Message {
    Message {
        topic: p.topic,
        payload: p.payload,
        qos: p.qos,
        retain: p.retain,
        dup: p.dup,
        packet_id: p.packet_id,
        content_type: None,
        correlation_data: None,
        message_expiry_seconds: None,
        payload_is_utf8: false,
        response_topic: None,
        subscription_identifiers: Vec::new(),
    }
}

fn message_from_v5(p: v5::PublishPacket) -> Message {
    Message {
        topic: p.topic,
        payload: p.payload,
        qos: p.qos,
        retain: p.retain,
        dup: p.dup,
        packet_id: p.packet_id,
        content_type: p.properties.content_type,
        correlation_data: p.properties.correlation_data,
        message_expiry_seconds: p.properties.message_expiry_interval,
        payload_is_utf8: p.properties.payload_format_indicator == Some(1),
        response_topic: p.properties.response_topic,
        subscription_identifiers: p.properties.subscription_identifiers,
    }
}

/// Turns a byte stream into [`Packet`]s. The protocol version is learned
/// from CONNECT and then fixed for the rest of the connection's lifetime,
/// matching how every MQTT version negotiates exactly once per session.
#[derive(Debug, Clone, Copy)]
pub struct Reader {
    version: Option<ProtocolVersion>,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    #[must_use]
    pub const fn new() -> Self {
        Self { version: None }
    }

    #[must_use]
    pub const fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    /// Try to decode one packet from the front of `buf`. Returns `Ok(None)`
    /// if `buf` doesn't yet hold a complete packet; the caller should read
    /// more bytes and retry. On success, the consumed prefix is returned
    /// alongside the packet so the caller can drain it from its buffer.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(usize, Packet)>, DecodeError> {
        let mut probe = ByteArray::new(buf);
        let header = match FixedHeader::decode(&mut probe) {
            Ok(h) => h,
            Err(DecodeError::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        if header.remaining_length > MAX_REMAINING_LENGTH {
            return Err(DecodeError::PacketTooLarge);
        }
        let header_len = probe.offset();
        let total_len = header_len + header.remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[header_len..total_len];
        let mut ba = ByteArray::new(body);
        let packet = self.decode_body(header.packet_type, &mut ba)?;
        Ok(Some((total_len, packet)))
    }

    fn decode_body(&mut self, packet_type: PacketTypeCode, ba: &mut ByteArray) -> Result<Packet, DecodeError> {
        if self.version.is_none() && !matches!(packet_type, PacketTypeCode::Connect) {
            return Err(DecodeError::InvalidPacketType);
        }

        match packet_type {
            PacketTypeCode::Connect => {
                let mut peek = ByteArray::new(ba.peek_remaining());
                let name = peek.read_utf8_string()?;
                let level = peek.read_byte()?;
                let version = ProtocolVersion::try_from((name.as_str(), level))
                    .map_err(|_| DecodeError::InvalidProtocolName)?;
                self.version = Some(version);
                let body = if version == ProtocolVersion::V5 {
                    let p = v5::ConnectPacket::decode(ba)?;
                    ConnectBody {
                        protocol_version: version,
                        clean_start: p.clean_start,
                        keep_alive: p.keep_alive,
                        client_id: p.client_id,
                        will: p.will.map(|w| Will {
                            topic: w.topic,
                            message: w.message,
                            qos: w.qos,
                            retain: w.retain,
                            delay_interval: w.properties.will_delay_interval.unwrap_or(0),
                        }),
                        username: p.username,
                        password: p.password,
                        session_expiry_interval: p.properties.session_expiry_interval,
                        receive_maximum: p.properties.receive_maximum,
                    }
                } else {
                    let p = v3::ConnectPacket::decode(ba)?;
                    ConnectBody {
                        protocol_version: version,
                        clean_start: p.clean_session,
                        keep_alive: p.keep_alive,
                        client_id: p.client_id,
                        will: p.will.map(|w| Will {
                            topic: w.topic,
                            message: w.message,
                            qos: w.qos,
                            retain: w.retain,
                            delay_interval: 0,
                        }),
                        username: p.username,
                        password: p.password,
                        session_expiry_interval: None,
                        receive_maximum: None,
                    }
                };
                Ok(Packet::Connect(body))
            }
            PacketTypeCode::Publish { dup, qos, retain } => {
                let message = if self.version == Some(ProtocolVersion::V5) {
                    message_from_v5(v5::PublishPacket::decode(ba, dup, qos, retain)?)
                } else {
                    message_from_v3(v3::PublishPacket::decode(ba, dup, qos, retain)?)
                };
                Ok(Packet::Publish(message))
            }
            PacketTypeCode::PubAck => Ok(Packet::PubAck(self.decode_ack(ba)?)),
            PacketTypeCode::PubRec => Ok(Packet::PubRec(self.decode_ack(ba)?)),
            PacketTypeCode::PubRel => Ok(Packet::PubRel(self.decode_ack(ba)?)),
            PacketTypeCode::PubComp => Ok(Packet::PubComp(self.decode_ack(ba)?)),
            PacketTypeCode::Subscribe => {
                let body = if self.version == Some(ProtocolVersion::V5) {
                    let p = v5::SubscribePacket::decode(ba)?;
                    SubscribeBody {
                        packet_id: p.packet_id,
                        subscription_identifier: p.properties.subscription_identifiers.first().copied(),
                        filters: p
                            .filters
                            .into_iter()
                            .map(|(filter, opts)| SubscribeFilter {
                                filter,
                                qos: opts.qos,
                                no_local: opts.no_local,
                                retain_as_published: opts.retain_as_published,
                                send_retained: !matches!(opts.retain_handling, v5::RetainHandling::DoNotSend),
                            })
                            .collect(),
                    }
                } else {
                    let p = v3::SubscribePacket::decode(ba)?;
                    SubscribeBody {
                        packet_id: p.packet_id,
                        subscription_identifier: None,
                        filters: p
                            .filters
                            .into_iter()
                            .map(|(filter, qos)| SubscribeFilter {
                                filter,
                                qos,
                                no_local: false,
                                retain_as_published: false,
                                send_retained: true,
                            })
                            .collect(),
                    }
                };
                Ok(Packet::Subscribe(body))
            }
            PacketTypeCode::Unsubscribe => {
                let body = if self.version == Some(ProtocolVersion::V5) {
                    let p = v5::UnsubscribePacket::decode(ba)?;
                    UnsubscribeBody {
                        packet_id: p.packet_id,
                        filters: p.filters,
                    }
                } else {
                    let p = v3::UnsubscribePacket::decode(ba)?;
                    UnsubscribeBody {
                        packet_id: p.packet_id,
                        filters: p.filters,
                    }
                };
                Ok(Packet::Unsubscribe(body))
            }
            PacketTypeCode::PingReq => Ok(Packet::PingReq),
            PacketTypeCode::PingResp => Ok(Packet::PingResp),
            PacketTypeCode::Disconnect => {
                let send_will = if self.version == Some(ProtocolVersion::V5) {
                    let p = v5::DisconnectPacket::decode(ba)?;
                    matches!(p.reason_code, v5::ReasonCode::DisconnectWithWillMessage)
                } else {
                    false
                };
                Ok(Packet::Disconnect(DisconnectBody { send_will }))
            }
            PacketTypeCode::ConnAck | PacketTypeCode::SubAck | PacketTypeCode::UnsubAck => {
                // Server-to-client only; a conforming client never sends
                // these, so decoding them here would only ever happen if
                // a peer misbehaves.
                Err(DecodeError::InvalidPacketType)
            }
        }
    }

    fn decode_ack(&self, ba: &mut ByteArray) -> Result<AckBody, DecodeError> {
        if self.version == Some(ProtocolVersion::V5) {
            let p = v5::AckPacket::decode(ba)?;
            Ok(AckBody {
                packet_id: p.packet_id,
                success: p.reason_code.to_byte() < 0x80,
            })
        } else {
            let p = v3::PubAckPacket::decode(ba)?;
            Ok(AckBody {
                packet_id: p.packet_id,
                success: true,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAck {
    pub packet_id: PacketId,
    pub success: bool,
}

/// Build the bytes for a PUBACK/PUBREC/PUBREL/PUBCOMP in the connection's
/// negotiated version.
pub fn encode_ack(
    version: ProtocolVersion,
    packet_type: PacketTypeCode,
    ack: EncodedAck,
) -> Result<Vec<u8>, crate::error::EncodeError> {
    let mut body = Vec::new();
    if version == ProtocolVersion::V5 {
        let reason_code = if ack.success {
            v5::ReasonCode::Success
        } else {
            v5::ReasonCode::UnspecifiedError
        };
        v5::AckPacket {
            packet_id: ack.packet_id,
            reason_code,
            properties: Properties::default(),
        }
        .encode(&mut body)?;
    } else {
        v3::PubAckPacket {
            packet_id: ack.packet_id,
        }
        .encode(&mut body)?;
    }
    wrap(packet_type, body)
}

fn wrap(packet_type: PacketTypeCode, body: Vec<u8>) -> Result<Vec<u8>, crate::error::EncodeError> {
    let mut out = Vec::new();
    FixedHeader {
        packet_type,
        remaining_length: body.len() as u32,
    }
    .encode(&mut out)?;
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn encode_connack(version: ProtocolVersion, ack: &ConnAckBody) -> Result<Vec<u8>, crate::error::EncodeError> {
    let mut body = Vec::new();
    if version == ProtocolVersion::V5 {
        let reason_code = match ack.reason {
            ConnectReason::Accepted => v5::ReasonCode::Success,
            ConnectReason::UnacceptableProtocolVersion => v5::ReasonCode::UnsupportedProtocolVersion,
            ConnectReason::IdentifierRejected => v5::ReasonCode::ClientIdentifierNotValid,
            ConnectReason::BadUserNameOrPassword => v5::ReasonCode::BadUsernameOrPassword,
            ConnectReason::NotAuthorized => v5::ReasonCode::NotAuthorized,
            ConnectReason::ServerUnavailable => v5::ReasonCode::ServerUnavailable,
        };
        v5::ConnAckPacket {
            session_present: ack.session_present,
            reason_code,
            properties: Properties {
                session_expiry_interval: ack.session_expiry_interval,
                ..Properties::default()
            },
        }
        .encode(&mut body)?;
    } else {
        let return_code = match ack.reason {
            ConnectReason::Accepted => v3::ConnectReturnCode::Accepted,
            ConnectReason::UnacceptableProtocolVersion => v3::ConnectReturnCode::UnacceptableProtocolVersion,
            ConnectReason::IdentifierRejected => v3::ConnectReturnCode::IdentifierRejected,
            ConnectReason::BadUserNameOrPassword => v3::ConnectReturnCode::BadUsernameOrPassword,
            ConnectReason::NotAuthorized => v3::ConnectReturnCode::NotAuthorized,
            ConnectReason::ServerUnavailable => v3::ConnectReturnCode::ServerUnavailable,
        };
        v3::ConnAckPacket {
            session_present: ack.session_present,
            return_code,
        }
        .encode(&mut body)?;
    }
    wrap(PacketTypeCode::ConnAck, body)
}

/// Encodes a server-initiated DISCONNECT with a reason code, v5 only — a
/// v3 peer has no such packet and the connection engine just closes the
/// socket instead for that protocol version.
pub fn encode_disconnect(reason_code: v5::ReasonCode) -> Result<Vec<u8>, crate::error::EncodeError> {
    let mut body = Vec::new();
    v5::DisconnectPacket {
        reason_code,
        properties: Properties::default(),
    }
    .encode(&mut body)?;
    wrap(PacketTypeCode::Disconnect, body)
}

pub fn encode_suback(version: ProtocolVersion, ack: &SubAckBody) -> Result<Vec<u8>, crate::error::EncodeError> {
    let mut body = Vec::new();
    if version == ProtocolVersion::V5 {
        let reason_codes = ack
            .results
            .iter()
            .map(|r| match r {
                Some(QoS::AtMostOnce) => v5::ReasonCode::GrantedQoS0,
                Some(QoS::AtLeastOnce) => v5::ReasonCode::GrantedQoS1,
                Some(QoS::ExactlyOnce) => v5::ReasonCode::GrantedQoS2,
                None => v5::ReasonCode::UnspecifiedError,
            })
            .collect();
        v5::SubAckPacket {
            packet_id: ack.packet_id,
            properties: Properties::default(),
            reason_codes,
        }
        .encode(&mut body)?;
    } else {
        let return_codes = ack
            .results
            .iter()
            .map(|r| match r {
                Some(qos) => v3::SubAckReturnCode::Success(*qos),
                None => v3::SubAckReturnCode::Failure,
            })
            .collect();
        v3::SubAckPacket {
            packet_id: ack.packet_id,
            return_codes,
        }
        .encode(&mut body)?;
    }
    wrap(PacketTypeCode::SubAck, body)
}

pub fn encode_unsuback(version: ProtocolVersion, ack: &UnsubAckBody) -> Result<Vec<u8>, crate::error::EncodeError> {
    let mut body = Vec::new();
    if version == ProtocolVersion::V5 {
        v5::UnsubAckPacket {
            packet_id: ack.packet_id,
            properties: Properties::default(),
            reason_codes: vec![v5::ReasonCode::Success],
        }
        .encode(&mut body)?;
    } else {
        v3::UnsubAckPacket {
            packet_id: ack.packet_id,
        }
        .encode(&mut body)?;
    }
    wrap(PacketTypeCode::UnsubAck, body)
}

pub fn encode_publish(version: ProtocolVersion, message: &Message) -> Result<Vec<u8>, crate::error::EncodeError> {
    let packet_type = PacketTypeCode::Publish {
        dup: message.dup,
        qos: message.qos,
        retain: message.retain,
    };
    let mut body = Vec::new();
    if version == ProtocolVersion::V5 {
        v5::PublishPacket {
            dup: message.dup,
            qos: message.qos,
            retain: message.retain,
            topic: message.topic.clone(),
            packet_id: message.packet_id,
            properties: Properties {
                content_type: message.content_type.clone(),
                correlation_data: message.correlation_data.clone(),
                message_expiry_interval: message.message_expiry_seconds,
                payload_format_indicator: Some(u8::from(message.payload_is_utf8)),
                response_topic: message.response_topic.clone(),
                subscription_identifiers: message.subscription_identifiers.clone(),
                ..Properties::default()
            },
            payload: message.payload.clone(),
        }
        .encode(&mut body)?;
    } else {
        v3::PublishPacket {
            dup: message.dup,
            qos: message.qos,
            retain: message.retain,
            topic: message.topic.clone(),
            packet_id: message.packet_id,
            payload: message.payload.clone(),
        }
        .encode(&mut body)?;
    }
    wrap(packet_type, body)
}

#[must_use]
pub fn encode_pingresp() -> Vec<u8> {
    wrap(PacketTypeCode::PingResp, Vec::new()).expect("PINGRESP body is always empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_v311_connect(client_id: &str) -> Vec<u8> {
        let packet = v3::ConnectPacket {
            protocol_version: ProtocolVersion::V311,
            clean_session: true,
            keep_alive: 30,
            client_id: client_id.to_string(),
            will: None,
            username: None,
            password: None,
        };
        let mut body = Vec::new();
        packet.encode(&mut body).unwrap();
        let mut out = Vec::new();
        FixedHeader {
            packet_type: PacketTypeCode::Connect,
            remaining_length: body.len() as u32,
        }
        .encode(&mut out)
        .unwrap();
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn reader_learns_protocol_version_from_connect() {
        let buf = encode_v311_connect("c1");
        let mut reader = Reader::new();
        let (consumed, packet) = reader.decode(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(reader.protocol_version(), Some(ProtocolVersion::V311));
        match packet {
            Packet::Connect(body) => assert_eq!(body.client_id, "c1"),
            _ => panic!("expected Connect"),
        }
    }

    #[test]
    fn reader_rejects_packets_before_connect() {
        let mut reader = Reader::new();
        let buf = [PacketTypeCode::PingReq.to_byte(), 0x00];
        assert!(reader.decode(&buf).is_err());
    }

    #[test]
    fn reader_reports_incomplete_for_partial_packet() {
        let buf = encode_v311_connect("c1");
        let mut reader = Reader::new();
        assert!(reader.decode(&buf[..buf.len() - 1]).unwrap().is_none());
    }
}
