// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Per-connection task: decodes the TCP stream into [`Packet`]s, forwards
//! protocol events to the broker actor, and writes back whatever the
//! broker or the delivery pump hands it. One task per client, the same
//! shape as the actor-per-session design the rest of this engine follows,
//! just collapsed onto channels instead of a process boundary.

use std::time::Duration;

use embermq_codec::error::DecodeError;
use embermq_codec::header::{PacketId, ProtocolVersion, QoS};
use embermq_codec::message::Message;
use embermq_codec::packet::{self, ConnectReason, DisconnectBody, EncodedAck, Packet, Reader, SubscribeFilter, Will};
use embermq_codec::header::PacketTypeCode;
use embermq_codec::v5::ReasonCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::config::Mqtt;
use crate::engine::broker::BrokerHandle;
use crate::error::Error;

const READ_CHUNK: usize = 4096;
const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// Messages flowing from a connection task to the broker actor.
pub enum EngineCmd {
    Connect {
        client_id: String,
        clean_start: bool,
        keep_alive: u16,
        protocol_version: ProtocolVersion,
        will: Option<Will>,
        session_expiry_interval: Option<u32>,
        conn_tx: mpsc::Sender<ToConnection>,
        reply: oneshot::Sender<ConnectOutcome>,
    },
    Subscribe {
        client_id: String,
        filters: Vec<SubscribeFilter>,
        subscription_identifier: Option<u32>,
        reply: oneshot::Sender<Vec<Option<QoS>>>,
    },
    Unsubscribe {
        client_id: String,
        filters: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Publish {
        client_id: String,
        message: Message,
        reply: Option<oneshot::Sender<()>>,
    },
    PubAck {
        client_id: String,
        packet_id: PacketId,
    },
    PubRec {
        client_id: String,
        packet_id: PacketId,
    },
    PubRel {
        client_id: String,
        packet_id: PacketId,
        reply: oneshot::Sender<()>,
    },
    PubComp {
        client_id: String,
        packet_id: PacketId,
    },
    Disconnect {
        client_id: String,
        send_will: bool,
    },
    ConnectionLost {
        client_id: String,
    },
    Reap,
}

/// Messages flowing from the broker actor back to a connection task.
pub enum ToConnection {
    Send(Vec<u8>),
    Close,
}

pub struct ConnectOutcome {
    pub session_present: bool,
    pub accepted: bool,
}

/// Drives one accepted TCP connection end to end: CONNECT handshake, the
/// read loop decoding further packets, and the write side draining
/// whatever the broker pumps toward this client.
pub async fn run_connection(mut socket: TcpStream, broker: BrokerHandle, mqtt_conf: Mqtt) -> Result<(), Error> {
    let mut reader = Reader::new();
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    let mut client_id = match read_connect(&mut socket, &mut reader, &mut buf, &mut chunk).await? {
        ConnectReadResult::Request(body) => body,
        ConnectReadResult::Rejected { reason, version } => {
            reject_connect(&mut socket, version, reason).await?;
            return Ok(());
        }
        ConnectReadResult::Closed => return Ok(()),
    };

    if client_id.client_id.is_empty() {
        if !mqtt_conf.allow_empty_client_id {
            reject_connect(&mut socket, client_id.protocol_version, ConnectReason::IdentifierRejected).await?;
            return Ok(());
        }
        client_id.client_id = embermq_codec::random_client_id();
    }
    if !mqtt_conf.allow_anonymous && client_id.username.is_none() {
        reject_connect(&mut socket, client_id.protocol_version, ConnectReason::NotAuthorized).await?;
        return Ok(());
    }
    let keep_alive = if mqtt_conf.max_keep_alive_secs > 0 {
        client_id.keep_alive.min(mqtt_conf.max_keep_alive_secs)
    } else {
        client_id.keep_alive
    };

    let (conn_tx, mut conn_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
    let (reply_tx, reply_rx) = oneshot::channel();
    broker
        .send(EngineCmd::Connect {
            client_id: client_id.client_id.clone(),
            clean_start: client_id.clean_start,
            keep_alive,
            protocol_version: client_id.protocol_version,
            will: client_id.will,
            session_expiry_interval: client_id.session_expiry_interval,
            conn_tx,
            reply: reply_tx,
        })
        .await?;
    let outcome = reply_rx.await.map_err(|_| Error::new(crate::error::ErrorKind::ChannelError, "broker dropped connect reply"))?;

    let reason = if outcome.accepted { ConnectReason::Accepted } else { ConnectReason::ServerUnavailable };
    let ack = packet::encode_connack(
        client_id.protocol_version,
        &packet::ConnAckBody {
            session_present: outcome.session_present,
            reason,
            session_expiry_interval: client_id.session_expiry_interval,
        },
    )?;
    socket.write_all(&ack).await?;
    if !outcome.accepted {
        return Ok(());
    }

    let keep_alive_deadline = if keep_alive == 0 {
        None
    } else {
        Some(Duration::from_secs(u64::from(keep_alive) * 3 / 2))
    };
    let client_id = client_id.client_id;
    let version = client_id_version(&reader);

    let result = run_loop(
        &mut socket,
        &mut reader,
        &mut buf,
        &mut chunk,
        &broker,
        &client_id,
        version,
        &mut conn_rx,
        keep_alive_deadline,
    )
    .await;

    let send_will = !matches!(result, Ok(DisconnectKind::Clean));
    let _ = broker
        .send(if send_will {
            EngineCmd::ConnectionLost {
                client_id: client_id.clone(),
            }
        } else {
            EngineCmd::Disconnect {
                client_id: client_id.clone(),
                send_will: false,
            }
        })
        .await;
    result.map(|_| ())
}

fn client_id_version(reader: &Reader) -> ProtocolVersion {
    reader.protocol_version().unwrap_or(ProtocolVersion::V311)
}

enum DisconnectKind {
    Clean,
    Dropped,
}

struct ConnectRequest {
    client_id: String,
    clean_start: bool,
    keep_alive: u16,
    protocol_version: ProtocolVersion,
    will: Option<Will>,
    session_expiry_interval: Option<u32>,
    username: Option<String>,
}

/// Outcome of reading the first packet off a fresh connection. §7 draws a
/// line between protocol violations worth a negative CONNACK (bad version,
/// bad client id) and everything else, which just closes the socket: a
/// non-CONNECT first packet, or a transport-level EOF, gives the peer no
/// version to key a meaningful reason code off of.
enum ConnectReadResult {
    Request(ConnectRequest),
    Rejected { reason: ConnectReason, version: ProtocolVersion },
    Closed,
}

async fn reject_connect(socket: &mut TcpStream, version: ProtocolVersion, reason: ConnectReason) -> Result<(), Error> {
    let ack = packet::encode_connack(
        version,
        &packet::ConnAckBody {
            session_present: false,
            reason,
            session_expiry_interval: None,
        },
    )?;
    socket.write_all(&ack).await?;
    Ok(())
}

async fn read_connect(
    socket: &mut TcpStream,
    reader: &mut Reader,
    buf: &mut Vec<u8>,
    chunk: &mut [u8],
) -> Result<ConnectReadResult, Error> {
    loop {
        match reader.decode(buf) {
            Ok(Some((consumed, packet))) => {
                buf.drain(0..consumed);
                return Ok(match packet {
                    Packet::Connect(body) => ConnectReadResult::Request(ConnectRequest {
                        client_id: body.client_id,
                        clean_start: body.clean_start,
                        keep_alive: body.keep_alive,
                        protocol_version: body.protocol_version,
                        will: body.will,
                        session_expiry_interval: body.session_expiry_interval,
                        username: body.username,
                    }),
                    _ => ConnectReadResult::Closed,
                });
            }
            Ok(None) => {}
            Err(DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel) => {
                return Ok(ConnectReadResult::Rejected {
                    reason: ConnectReason::UnacceptableProtocolVersion,
                    version: ProtocolVersion::V311,
                });
            }
            Err(DecodeError::InvalidClientId) => {
                return Ok(ConnectReadResult::Rejected {
                    reason: ConnectReason::IdentifierRejected,
                    version: client_id_version(reader),
                });
            }
            Err(_) => return Ok(ConnectReadResult::Closed),
        }
        let n = socket.read(chunk).await?;
        if n == 0 {
            return Ok(ConnectReadResult::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    socket: &mut TcpStream,
    reader: &mut Reader,
    buf: &mut Vec<u8>,
    chunk: &mut [u8],
    broker: &BrokerHandle,
    client_id: &str,
    version: ProtocolVersion,
    conn_rx: &mut mpsc::Receiver<ToConnection>,
    keep_alive_deadline: Option<Duration>,
) -> Result<DisconnectKind, Error> {
    loop {
        loop {
            match reader.decode(buf) {
                Ok(Some((consumed, packet))) => {
                    buf.drain(0..consumed);
                    if let Some(outcome) = handle_packet(socket, broker, client_id, version, packet).await? {
                        return Ok(outcome);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    send_protocol_violation_disconnect(socket, version, &err).await?;
                    return Ok(DisconnectKind::Dropped);
                }
            }
        }

        let read_fut = socket.read(chunk);
        tokio::select! {
            n = timed(read_fut, keep_alive_deadline) => {
                let n = n??;
                if n == 0 {
                    return Ok(DisconnectKind::Dropped);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            msg = conn_rx.recv() => {
                match msg {
                    Some(ToConnection::Send(bytes)) => socket.write_all(&bytes).await?,
                    Some(ToConnection::Close) | None => return Ok(DisconnectKind::Dropped),
                }
            }
        }
    }
}

/// §7: a decode failure after the handshake is a protocol violation. A v5
/// peer gets a DISCONNECT carrying the closest matching reason code so it
/// can tell a malformed packet from a protocol-sequencing error; v3.1.1 has
/// no such packet, so the socket just closes.
async fn send_protocol_violation_disconnect(socket: &mut TcpStream, version: ProtocolVersion, err: &DecodeError) -> Result<(), Error> {
    if version != ProtocolVersion::V5 {
        return Ok(());
    }
    let reason_code = match err {
        DecodeError::InvalidTopicName => ReasonCode::TopicNameInvalid,
        DecodeError::InvalidTopicFilter => ReasonCode::TopicFilterInvalid,
        DecodeError::InvalidPacketType | DecodeError::InvalidPacketFlags => ReasonCode::ProtocolError,
        _ => ReasonCode::MalformedPacket,
    };
    let bytes = packet::encode_disconnect(reason_code)?;
    socket.write_all(&bytes).await?;
    Ok(())
}

async fn timed<F, T>(fut: F, deadline: Option<Duration>) -> Result<Result<T, Error>, Error>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match deadline {
        Some(d) => match timeout(d, fut).await {
            Ok(res) => Ok(res.map_err(Error::from)),
            Err(_) => Err(Error::new(crate::error::ErrorKind::IoError, "keep-alive deadline exceeded")),
        },
        None => Ok(fut.await.map_err(Error::from)),
    }
}

async fn handle_packet(
    socket: &mut TcpStream,
    broker: &BrokerHandle,
    client_id: &str,
    version: ProtocolVersion,
    packet: Packet,
) -> Result<Option<DisconnectKind>, Error> {
    match packet {
        Packet::Publish(message) => {
            let needs_ack = message.qos != QoS::AtMostOnce;
            let packet_id = message.packet_id;
            let qos = message.qos;
            if needs_ack {
                let (tx, rx) = oneshot::channel();
                broker
                    .send(EngineCmd::Publish {
                        client_id: client_id.to_string(),
                        message,
                        reply: Some(tx),
                    })
                    .await?;
                let _ = rx.await;
                let Some(pid) = packet_id else {
                    return Ok(None);
                };
                let ack_type = if qos == QoS::ExactlyOnce {
                    PacketTypeCode::PubRec
                } else {
                    PacketTypeCode::PubAck
                };
                let bytes = packet::encode_ack(version, ack_type, EncodedAck { packet_id: pid, success: true })?;
                socket.write_all(&bytes).await?;
            } else {
                broker
                    .send(EngineCmd::Publish {
                        client_id: client_id.to_string(),
                        message,
                        reply: None,
                    })
                    .await?;
            }
            Ok(None)
        }
        Packet::PubAck(ack) => {
            broker
                .send(EngineCmd::PubAck {
                    client_id: client_id.to_string(),
                    packet_id: ack.packet_id,
                })
                .await?;
            Ok(None)
        }
        Packet::PubRec(ack) => {
            broker
                .send(EngineCmd::PubRec {
                    client_id: client_id.to_string(),
                    packet_id: ack.packet_id,
                })
                .await?;
            let bytes = packet::encode_ack(
                version,
                PacketTypeCode::PubRel,
                EncodedAck {
                    packet_id: ack.packet_id,
                    success: true,
                },
            )?;
            socket.write_all(&bytes).await?;
            Ok(None)
        }
        Packet::PubRel(ack) => {
            let (tx, rx) = oneshot::channel();
            broker
                .send(EngineCmd::PubRel {
                    client_id: client_id.to_string(),
                    packet_id: ack.packet_id,
                    reply: tx,
                })
                .await?;
            let _ = rx.await;
            let bytes = packet::encode_ack(
                version,
                PacketTypeCode::PubComp,
                EncodedAck {
                    packet_id: ack.packet_id,
                    success: true,
                },
            )?;
            socket.write_all(&bytes).await?;
            Ok(None)
        }
        Packet::PubComp(ack) => {
            broker
                .send(EngineCmd::PubComp {
                    client_id: client_id.to_string(),
                    packet_id: ack.packet_id,
                })
                .await?;
            Ok(None)
        }
        Packet::Subscribe(body) => {
            let (tx, rx) = oneshot::channel();
            broker
                .send(EngineCmd::Subscribe {
                    client_id: client_id.to_string(),
                    filters: body.filters,
                    subscription_identifier: body.subscription_identifier,
                    reply: tx,
                })
                .await?;
            let results = rx.await.unwrap_or_default();
            let bytes = packet::encode_suback(
                version,
                &packet::SubAckBody {
                    packet_id: body.packet_id,
                    results,
                },
            )?;
            socket.write_all(&bytes).await?;
            Ok(None)
        }
        Packet::Unsubscribe(body) => {
            let (tx, rx) = oneshot::channel();
            broker
                .send(EngineCmd::Unsubscribe {
                    client_id: client_id.to_string(),
                    filters: body.filters,
                    reply: tx,
                })
                .await?;
            let _ = rx.await;
            let bytes = packet::encode_unsuback(version, &packet::UnsubAckBody { packet_id: body.packet_id })?;
            socket.write_all(&bytes).await?;
            Ok(None)
        }
        Packet::PingReq => {
            socket.write_all(&packet::encode_pingresp()).await?;
            Ok(None)
        }
        Packet::Disconnect(DisconnectBody { send_will }) => {
            broker
                .send(EngineCmd::Disconnect {
                    client_id: client_id.to_string(),
                    send_will,
                })
                .await?;
            Ok(Some(DisconnectKind::Clean))
        }
        Packet::Connect(_) | Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
            Ok(Some(DisconnectKind::Dropped))
        }
    }
}
