// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Accepts TCP connections and spawns one [`crate::engine::connection`]
//! task per client, plus a background task that periodically reaps
//! expired sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::engine::{self, BrokerHandle, EngineCmd};
use crate::error::Error;

const REAP_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(config: Config) -> Result<(), Error> {
    let listen_addr = config.general.listen_addr.clone();
    let max_connections = config.general.max_connections;
    let mqtt_conf = config.mqtt.clone();
    let broker = engine::spawn(config);

    tokio::spawn(run_reaper(broker.clone()));

    let listener = TcpListener::bind(&listen_addr).await?;
    log::info!("listening on {listen_addr}");

    let live_connections = Arc::new(AtomicUsize::new(0));

    loop {
        let (mut socket, peer_addr) = listener.accept().await?;
        log::debug!("accepted connection from {peer_addr}");

        if max_connections > 0 && live_connections.load(Ordering::Acquire) >= max_connections {
            log::warn!("rejecting connection from {peer_addr}: at max_connections ({max_connections})");
            let _ = socket.shutdown().await;
            continue;
        }
        live_connections.fetch_add(1, Ordering::AcqRel);

        let broker = broker.clone();
        let mqtt_conf = mqtt_conf.clone();
        let live_connections = live_connections.clone();
        tokio::spawn(async move {
            if let Err(err) = engine::run_connection(socket, broker, mqtt_conf).await {
                log::warn!("connection from {peer_addr} ended with error: {err}");
            }
            live_connections.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

async fn run_reaper(broker: BrokerHandle) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    loop {
        ticker.tick().await;
        if broker.send(EngineCmd::Reap).await.is_err() {
            log::error!("broker actor gone, stopping session reaper");
            return;
        }
    }
}
