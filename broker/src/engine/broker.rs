// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! The broker actor: the single task that owns every piece of shared
//! state (sessions, subscriptions, retained messages) and serializes all
//! mutation through one `EngineCmd` channel. Connection tasks never touch
//! this state directly; they only ever send commands and, where a wire
//! reply depends on the outcome, await a oneshot reply.

use std::time::{Duration, Instant};

use embermq_codec::header::{PacketTypeCode, QoS};
use embermq_codec::message::Message;
use embermq_codec::packet::{self, EncodedAck};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::engine::connection::{EngineCmd, ToConnection, ConnectOutcome};
use crate::error::Error;
use crate::session::{Session, Will as SessionWill};
use crate::store::queue::{NullNotifier, QueueError};
use crate::store::trie::Subscriber;
use crate::store::{RetainedStore, SessionRecord, SessionStore, SubscriptionTrie};

/// A clonable, cheap-to-pass handle to the broker actor's command channel.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<EngineCmd>,
}

impl BrokerHandle {
    pub async fn send(&self, cmd: EngineCmd) -> Result<(), Error> {
        self.tx.send(cmd).await.map_err(Error::from)
    }
}

pub struct Broker {
    config: Config,
    sessions: SessionStore,
    subscriptions: SubscriptionTrie,
    retained: RetainedStore,
    connections: std::collections::HashMap<String, mpsc::Sender<ToConnection>>,
}

/// Spawns the broker actor and returns a handle to talk to it.
#[must_use]
pub fn spawn(config: Config) -> BrokerHandle {
    let (tx, rx) = mpsc::channel(1024);
    let broker = Broker {
        config,
        sessions: SessionStore::new(),
        subscriptions: SubscriptionTrie::new(),
        retained: RetainedStore::new(),
        connections: std::collections::HashMap::new(),
    };
    tokio::spawn(broker.run(rx));
    BrokerHandle { tx }
}

impl Broker {
    async fn run(mut self, mut rx: mpsc::Receiver<EngineCmd>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
        }
    }

    async fn handle(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::Connect {
                client_id,
                clean_start,
                keep_alive: _,
                protocol_version,
                will,
                session_expiry_interval,
                conn_tx,
                reply,
            } => {
                self.on_connect(client_id, clean_start, protocol_version, will, session_expiry_interval, conn_tx, reply)
                    .await
            }
            EngineCmd::Subscribe {
                client_id,
                filters,
                subscription_identifier,
                reply,
            } => self.on_subscribe(client_id, filters, subscription_identifier, reply).await,
            EngineCmd::Unsubscribe { client_id, filters, reply } => self.on_unsubscribe(client_id, filters, reply),
            EngineCmd::Publish { client_id, message, reply } => self.on_publish(client_id, message, reply).await,
            EngineCmd::PubAck { client_id, packet_id } => self.on_pub_ack(&client_id, packet_id).await,
            EngineCmd::PubRec { client_id, packet_id } => self.on_pub_rec(&client_id, packet_id),
            EngineCmd::PubRel { client_id, packet_id, reply } => self.on_pub_rel(client_id, packet_id, reply),
            EngineCmd::PubComp { client_id, packet_id } => self.on_pub_comp(&client_id, packet_id).await,
            EngineCmd::Disconnect { client_id, send_will } => self.on_disconnect(client_id, send_will).await,
            EngineCmd::ConnectionLost { client_id } => self.on_connection_lost(client_id).await,
            EngineCmd::Reap => self.reap(),
        }
    }

    async fn on_connect(
        &mut self,
        client_id: String,
        clean_start: bool,
        protocol_version: embermq_codec::header::ProtocolVersion,
        will: Option<packet::Will>,
        session_expiry_interval: Option<u32>,
        conn_tx: mpsc::Sender<ToConnection>,
        reply: tokio::sync::oneshot::Sender<ConnectOutcome>,
    ) {
        // [MQTT-3.1.4-2]: a client id already connected gets disconnected.
        if let Some(old_tx) = self.connections.remove(&client_id) {
            let _ = old_tx.send(ToConnection::Close).await;
        }

        let expiry = session_expiry_interval.unwrap_or(self.config.mqtt.default_session_expiry_secs);
        let will = will.map(|w| SessionWill {
            topic: w.topic,
            message: w.message,
            qos: w.qos,
            retain: w.retain,
            delay_interval: w.delay_interval,
        });

        let session_present = if clean_start {
            if let Some(old) = self.sessions.remove(&client_id) {
                self.subscriptions.remove_client(&old.session.client_id);
            }
            false
        } else {
            self.sessions.contains(&client_id)
        };

        if !self.sessions.contains(&client_id) {
            self.sessions.insert(SessionRecord::new(
                Session::new(client_id.clone(), will, expiry),
                self.config.mqtt.max_queued_messages,
                self.config.mqtt.max_packet_size,
                self.inflight_expiry(),
            ));
        } else if let Some(record) = self.sessions.get_mut(&client_id) {
            record.session.will = will;
            record.session.expiry_interval_secs = expiry;
            record.session.disconnected_at = None;
        }
        if let Some(record) = self.sessions.get_mut(&client_id) {
            record.session.protocol_version = protocol_version;
        }

        if let Some(record) = self.sessions.get_mut(&client_id) {
            record.queue.init(clean_start);
            record.unack.init(clean_start);
        }

        self.connections.insert(client_id.clone(), conn_tx);
        let _ = reply.send(ConnectOutcome {
            session_present,
            accepted: true,
        });

        self.pump(&client_id).await;
    }

    async fn on_subscribe(
        &mut self,
        client_id: String,
        filters: Vec<packet::SubscribeFilter>,
        subscription_identifier: Option<u32>,
        reply: tokio::sync::oneshot::Sender<Vec<Option<QoS>>>,
    ) {
        let mut results = Vec::with_capacity(filters.len());
        let mut retained_filters = Vec::new();

        for filter in &filters {
            self.subscriptions.subscribe(
                &filter.filter,
                Subscriber {
                    client_id: client_id.clone(),
                    qos: filter.qos,
                    no_local: filter.no_local,
                    retain_as_published: filter.retain_as_published,
                    subscription_identifier,
                },
            );
            results.push(Some(filter.qos));
            if filter.send_retained {
                retained_filters.push(filter.filter.clone());
            }
        }
        let _ = reply.send(results);

        for filter in retained_filters {
            let matches = self.retained.matching(&filter);
            for message in matches {
                self.enqueue_for(&client_id, message, true);
            }
        }
        self.pump(&client_id).await;
    }

    fn on_unsubscribe(&mut self, client_id: String, filters: Vec<String>, reply: tokio::sync::oneshot::Sender<()>) {
        for filter in filters {
            self.subscriptions.unsubscribe(&filter, &client_id);
        }
        let _ = reply.send(());
    }

    async fn on_publish(&mut self, client_id: String, message: Message, reply: Option<tokio::sync::oneshot::Sender<()>>) {
        let is_duplicate = if message.qos == QoS::ExactlyOnce {
            match (message.packet_id, self.sessions.get_mut(&client_id)) {
                (Some(pid), Some(record)) => record.unack.set(pid),
                _ => false,
            }
        } else {
            false
        };

        if message.retain {
            self.retained.publish(message.clone());
        }

        if !is_duplicate {
            let subscribers = self.subscriptions.matching(&message.topic);
            let mut targets = Vec::with_capacity(subscribers.len());
            for subscriber in subscribers {
                if subscriber.no_local && subscriber.client_id == client_id {
                    continue;
                }
                let qos = message.qos.min(subscriber.qos);
                let mut delivery = message.for_delivery(None, qos, subscriber.subscription_identifier.into_iter().collect());
                delivery.retain = subscriber.retain_as_published && message.retain;
                self.enqueue_for(&subscriber.client_id, delivery, false);
                targets.push(subscriber.client_id);
            }
            for target in targets {
                self.pump(&target).await;
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    async fn on_pub_ack(&mut self, client_id: &str, packet_id: embermq_codec::header::PacketId) {
        if let Some(record) = self.sessions.get_mut(client_id) {
            record.queue.remove(packet_id, &NullNotifier);
            record.packet_ids.release(packet_id);
        }
        self.pump(client_id).await;
    }

    /// PUBREC acks receipt of a QoS 2 delivery; the queue element stays
    /// inflight until PUBCOMP, but from here on a resend of it must carry
    /// a PUBREL rather than a duplicate PUBLISH. The connection task
    /// replies with the immediate PUBREL itself; this only affects what
    /// happens if the client disconnects before sending PUBCOMP.
    fn on_pub_rec(&mut self, client_id: &str, packet_id: embermq_codec::header::PacketId) {
        if let Some(record) = self.sessions.get_mut(client_id) {
            record.queue.mark_pubrel_pending(packet_id);
        }
    }

    fn on_pub_rel(&mut self, client_id: String, packet_id: embermq_codec::header::PacketId, reply: tokio::sync::oneshot::Sender<()>) {
        if let Some(record) = self.sessions.get_mut(&client_id) {
            record.unack.remove(packet_id);
        }
        let _ = reply.send(());
    }

    async fn on_pub_comp(&mut self, client_id: &str, packet_id: embermq_codec::header::PacketId) {
        if let Some(record) = self.sessions.get_mut(client_id) {
            record.queue.remove(packet_id, &NullNotifier);
            record.packet_ids.release(packet_id);
        }
        self.pump(client_id).await;
    }

    async fn on_disconnect(&mut self, client_id: String, send_will: bool) {
        self.connections.remove(&client_id);
        let will = self.sessions.get(&client_id).and_then(|r| r.session.will.clone());
        self.sessions.mark_disconnected(&client_id, Instant::now());
        if send_will {
            if let Some(will) = will {
                self.publish_will(&client_id, will).await;
            }
        }
        if let Some(record) = self.sessions.get_mut(&client_id) {
            record.session.will = None;
        }
    }

    async fn on_connection_lost(&mut self, client_id: String) {
        self.connections.remove(&client_id);
        let will = self.sessions.get(&client_id).and_then(|r| r.session.will.clone());
        self.sessions.mark_disconnected(&client_id, Instant::now());
        if let Some(will) = will {
            self.publish_will(&client_id, will).await;
        }
        if let Some(record) = self.sessions.get_mut(&client_id) {
            record.session.will = None;
        }
    }

    async fn publish_will(&mut self, client_id: &str, will: SessionWill) {
        let message = Message {
            topic: will.topic,
            payload: will.message,
            qos: will.qos,
            retain: will.retain,
            dup: false,
            packet_id: None,
            content_type: None,
            correlation_data: None,
            message_expiry_seconds: None,
            payload_is_utf8: false,
            response_topic: None,
            subscription_identifiers: Vec::new(),
        };
        self.on_publish(client_id.to_string(), message, None).await;
    }

    fn inflight_expiry(&self) -> Option<Duration> {
        (self.config.mqtt.inflight_expiry_secs > 0).then(|| Duration::from_secs(self.config.mqtt.inflight_expiry_secs))
    }

    fn enqueue_for(&mut self, client_id: &str, message: Message, force_retain: bool) {
        let mut message = message;
        if force_retain {
            message.retain = true;
        }
        if let Some(record) = self.sessions.get_mut(client_id) {
            record.queue.add(message, Instant::now(), &NullNotifier);
        }
    }

    /// Drain as much of `client_id`'s outbound queue onto its connection
    /// as packet id capacity and the queue's own contents allow. A no-op
    /// if the client isn't currently connected.
    async fn pump(&mut self, client_id: &str) {
        let Some(conn_tx) = self.connections.get(client_id).cloned() else {
            return;
        };
        let now = Instant::now();

        let Some(record) = self.sessions.get_mut(client_id) else {
            return;
        };
        let version = record.session.protocol_version;

        // Already-assigned elements from before a disconnect are resent
        // regardless of how much fresh packet id capacity remains: their
        // ids were claimed long ago and are still held by this session.
        let inflight = record.queue.read_inflight(record.queue.len(), now);
        for mut element in inflight {
            let encoded = if element.awaiting_pubrel {
                let packet_id = element
                    .message
                    .packet_id
                    .expect("an inflight element always carries a packet id");
                packet::encode_ack(version, PacketTypeCode::PubRel, EncodedAck { packet_id, success: true })
            } else {
                element.message.dup = true;
                packet::encode_publish(version, &element.message)
            };
            if let Ok(bytes) = encoded {
                let _ = conn_tx.try_send(ToConnection::Send(bytes));
            }
        }

        loop {
            let available = record.packet_ids.available();
            if available == 0 {
                break;
            }
            let ids = record.packet_ids.poll_batch(available);
            if ids.is_empty() {
                break;
            }
            let out = match record.queue.read(&ids, now, &NullNotifier) {
                Ok(out) => out,
                Err(QueueError::InflightNotDrained | QueueError::Closed) => {
                    record.packet_ids.release_batch(&ids);
                    break;
                }
            };
            let used = out.iter().filter(|e| e.message.packet_id.is_some()).count();
            if used < ids.len() {
                record.packet_ids.release_batch(&ids[used..]);
            }
            if out.is_empty() {
                break;
            }
            for element in &out {
                if let Ok(bytes) = packet::encode_publish(version, &element.message) {
                    let _ = conn_tx.try_send(ToConnection::Send(bytes));
                }
            }
        }
    }

    /// Periodic sweep dropping every session whose expiry interval has
    /// elapsed, triggered by [`EngineCmd::Reap`] from the reaper task in
    /// [`crate::server`].
    fn reap(&mut self) {
        let expired = self.sessions.reap_expired(Instant::now());
        for client_id in expired {
            self.subscriptions.remove_client(&client_id);
        }
    }
}
