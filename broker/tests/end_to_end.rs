// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! End-to-end scenarios driving the broker actor the way a real connection
//! task would: through [`EngineCmd`] on one side and a `ToConnection`
//! receiver standing in for the socket write half on the other.

use std::time::Duration;

use embermq::config::Config;
use embermq::engine::{spawn, BrokerHandle, EngineCmd, ToConnection};
use embermq_codec::header::{FixedHeader, PacketTypeCode, ProtocolVersion, QoS};
use embermq_codec::message::Message;
use embermq_codec::packet::{Packet, Reader, SubscribeFilter, Will};
use embermq_codec::v3::ConnectPacket;
use tokio::sync::{mpsc, oneshot};

/// A v3.1.1 CONNECT, wire-encoded, used only to teach a client-side
/// [`Reader`] which protocol version to decode subsequent bytes as — the
/// broker itself never sees this, connection setup goes through
/// [`connect`] below instead.
fn v311_connect_bytes(client_id: &str) -> Vec<u8> {
    let packet = ConnectPacket {
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

/// A decoder primed to the wire version every test client speaks, standing
/// in for the per-connection [`Reader`] `run_connection` owns.
fn client_reader() -> Reader {
    let mut reader = Reader::new();
    let primer = v311_connect_bytes("reader-primer");
    reader.decode(&primer).unwrap();
    reader
}

fn decode_one(reader: &mut Reader, bytes: &[u8]) -> Packet {
    let (consumed, packet) = reader.decode(bytes).unwrap().expect("a full packet");
    assert_eq!(consumed, bytes.len());
    packet
}

struct TestClient {
    client_id: String,
    conn_rx: mpsc::Receiver<ToConnection>,
    reader: Reader,
}

impl TestClient {
    async fn connect(broker: &BrokerHandle, client_id: &str, clean_start: bool, will: Option<Will>) -> (Self, bool) {
        let (conn_tx, conn_rx) = mpsc::channel(64);
        let (reply_tx, reply_rx) = oneshot::channel();
        broker
            .send(EngineCmd::Connect {
                client_id: client_id.to_string(),
                clean_start,
                keep_alive: 30,
                protocol_version: ProtocolVersion::V311,
                will,
                session_expiry_interval: Some(300),
                conn_tx,
                reply: reply_tx,
            })
            .await
            .unwrap();
        let outcome = reply_rx.await.unwrap();
        assert!(outcome.accepted);
        (
            Self {
                client_id: client_id.to_string(),
                conn_rx,
                reader: client_reader(),
            },
            outcome.session_present,
        )
    }

    async fn subscribe(&mut self, broker: &BrokerHandle, filter: &str, qos: QoS) {
        let (tx, rx) = oneshot::channel();
        broker
            .send(EngineCmd::Subscribe {
                client_id: self.client_id.clone(),
                filters: vec![SubscribeFilter {
                    filter: filter.to_string(),
                    qos,
                    no_local: false,
                    retain_as_published: false,
                    send_retained: true,
                }],
                subscription_identifier: None,
                reply: tx,
            })
            .await
            .unwrap();
        let granted = rx.await.unwrap();
        assert_eq!(granted, vec![Some(qos)]);
    }

    /// Waits for and decodes the next pushed packet, skipping a short
    /// settle delay since the broker actor processes commands
    /// asynchronously relative to the test driver.
    async fn recv_packet(&mut self) -> Packet {
        let msg = tokio::time::timeout(Duration::from_secs(1), self.conn_rx.recv())
            .await
            .expect("a packet within the timeout")
            .expect("channel still open");
        match msg {
            ToConnection::Send(bytes) => decode_one(&mut self.reader, &bytes),
            ToConnection::Close => panic!("expected a packet, got Close"),
        }
    }

    async fn recv_close(&mut self) {
        let msg = tokio::time::timeout(Duration::from_secs(1), self.conn_rx.recv())
            .await
            .expect("a message within the timeout")
            .expect("channel still open");
        assert!(matches!(msg, ToConnection::Close));
    }

    async fn expect_silence(&mut self) {
        let res = tokio::time::timeout(Duration::from_millis(150), self.conn_rx.recv()).await;
        assert!(res.is_err(), "expected no further packets");
    }
}

fn publish(topic: &str, payload: &[u8], qos: QoS, packet_id: Option<u16>, retain: bool) -> Message {
    Message {
        topic: topic.to_string(),
        payload: payload.to_vec(),
        qos,
        retain,
        dup: false,
        packet_id,
        content_type: None,
        correlation_data: None,
        message_expiry_seconds: None,
        payload_is_utf8: false,
        response_topic: None,
        subscription_identifiers: Vec::new(),
    }
}

#[tokio::test]
async fn qos1_round_trip() {
    let broker = spawn(Config::default());
    let (mut a, _) = TestClient::connect(&broker, "A", true, None).await;
    a.subscribe(&broker, "temp/+", QoS::AtLeastOnce).await;

    let (b, _) = TestClient::connect(&broker, "B", true, None).await;
    let (tx, rx) = oneshot::channel();
    broker
        .send(EngineCmd::Publish {
            client_id: b.client_id.clone(),
            message: publish("temp/kitchen", b"42", QoS::AtLeastOnce, Some(1), false),
            reply: Some(tx),
        })
        .await
        .unwrap();
    rx.await.unwrap();

    let Packet::Publish(delivered) = a.recv_packet().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(delivered.topic, "temp/kitchen");
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    assert_eq!(delivered.payload, b"42");
    let pid = delivered.packet_id.expect("qos1 carries a packet id");

    broker
        .send(EngineCmd::PubAck {
            client_id: "A".to_string(),
            packet_id: pid,
        })
        .await
        .unwrap();
    a.expect_silence().await;
}

#[tokio::test]
async fn qos2_duplicate_is_not_refanned_out() {
    let broker = spawn(Config::default());
    let (mut a, _) = TestClient::connect(&broker, "A", true, None).await;
    a.subscribe(&broker, "x", QoS::ExactlyOnce).await;
    let (b, _) = TestClient::connect(&broker, "B", true, None).await;

    let send = |pid: u16| {
        let broker = broker.clone();
        let client_id = b.client_id.clone();
        async move {
            let (tx, rx) = oneshot::channel();
            broker
                .send(EngineCmd::Publish {
                    client_id,
                    message: publish("x", b"hi", QoS::ExactlyOnce, Some(pid), false),
                    reply: Some(tx),
                })
                .await
                .unwrap();
            rx.await.unwrap();
        }
    };

    send(7).await;
    let Packet::Publish(first) = a.recv_packet().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(first.payload, b"hi");

    // B resends the same (dup, id=7) PUBLISH; the broker must ack it again
    // without a second fan-out to A.
    send(7).await;
    a.expect_silence().await;
}

#[tokio::test]
async fn retained_message_replays_on_subscribe() {
    let broker = spawn(Config::default());
    let (b, _) = TestClient::connect(&broker, "B", true, None).await;
    let (tx, rx) = oneshot::channel::<()>();
    broker
        .send(EngineCmd::Publish {
            client_id: b.client_id.clone(),
            message: publish("a/b", b"hi", QoS::AtMostOnce, None, true),
            reply: None,
        })
        .await
        .unwrap();
    drop((tx, rx));

    let (mut a, _) = TestClient::connect(&broker, "A", true, None).await;
    a.subscribe(&broker, "a/+", QoS::AtMostOnce).await;

    let Packet::Publish(replayed) = a.recv_packet().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(replayed.topic, "a/b");
    assert_eq!(replayed.payload, b"hi");
    assert!(replayed.retain);
}

#[tokio::test]
async fn retained_message_cleared_by_empty_payload() {
    let broker = spawn(Config::default());
    let (b, _) = TestClient::connect(&broker, "B", true, None).await;
    broker
        .send(EngineCmd::Publish {
            client_id: b.client_id.clone(),
            message: publish("a/b", b"hi", QoS::AtMostOnce, None, true),
            reply: None,
        })
        .await
        .unwrap();
    broker
        .send(EngineCmd::Publish {
            client_id: b.client_id.clone(),
            message: publish("a/b", b"", QoS::AtMostOnce, None, true),
            reply: None,
        })
        .await
        .unwrap();

    let (mut a, _) = TestClient::connect(&broker, "A", true, None).await;
    a.subscribe(&broker, "a/b", QoS::AtMostOnce).await;
    a.expect_silence().await;
}

#[tokio::test]
async fn queue_full_drops_the_unackable_excess() {
    let mut config = Config::default();
    config.mqtt.max_queued_messages = 2;
    let broker = spawn(config);

    let (mut a, _) = TestClient::connect(&broker, "A", true, None).await;
    a.subscribe(&broker, "x", QoS::AtLeastOnce).await;
    let (b, _) = TestClient::connect(&broker, "B", true, None).await;

    // None of these three are ever acked, so by the time the third lands
    // the queue already holds two still-inflight elements and nothing can
    // be evicted to make room for it.
    for payload in [b"1".as_slice(), b"2".as_slice(), b"3".as_slice()] {
        broker
            .send(EngineCmd::Publish {
                client_id: b.client_id.clone(),
                message: publish("x", payload, QoS::AtLeastOnce, None, false),
                reply: None,
            })
            .await
            .unwrap();
    }

    let Packet::Publish(first) = a.recv_packet().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(first.payload, b"1");
    let Packet::Publish(second) = a.recv_packet().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(second.payload, b"2");
    a.expect_silence().await;
}

#[tokio::test]
async fn session_takeover_closes_the_old_connection() {
    let broker = spawn(Config::default());
    let (mut first, _) = TestClient::connect(&broker, "c", false, None).await;

    let (_second, session_present) = TestClient::connect(&broker, "c", false, None).await;
    assert!(session_present, "resumed session must report session_present");

    first.recv_close().await;
}

#[tokio::test]
async fn will_is_published_on_connection_loss_but_not_on_clean_disconnect() {
    let broker = spawn(Config::default());
    let (mut watcher, _) = TestClient::connect(&broker, "watcher", true, None).await;
    watcher.subscribe(&broker, "status/#", QoS::AtMostOnce).await;

    let will = Will {
        topic: "status/offline".to_string(),
        message: b"bye".to_vec(),
        qos: QoS::AtMostOnce,
        retain: false,
        delay_interval: 0,
    };
    let (_victim, _) = TestClient::connect(&broker, "victim", true, Some(will)).await;
    broker
        .send(EngineCmd::ConnectionLost {
            client_id: "victim".to_string(),
        })
        .await
        .unwrap();

    let Packet::Publish(delivered) = watcher.recv_packet().await else {
        panic!("expected the will to be published");
    };
    assert_eq!(delivered.topic, "status/offline");

    let will = Will {
        topic: "status/offline".to_string(),
        message: b"bye again".to_vec(),
        qos: QoS::AtMostOnce,
        retain: false,
        delay_interval: 0,
    };
    let (_victim2, _) = TestClient::connect(&broker, "victim2", true, Some(will)).await;
    broker
        .send(EngineCmd::Disconnect {
            client_id: "victim2".to_string(),
            send_will: false,
        })
        .await
        .unwrap();
    watcher.expect_silence().await;
}
