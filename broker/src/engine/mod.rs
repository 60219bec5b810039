// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! The connection-handling and broker-state layer: one task per accepted
//! socket (`connection`) talking to a single actor that owns all shared
//! state (`broker`).

pub mod broker;
pub mod connection;

pub use broker::{spawn, Broker, BrokerHandle};
pub use connection::{run_connection, EngineCmd, ToConnection};
