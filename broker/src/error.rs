// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

use tokio::sync::mpsc;

use crate::engine::connection::EngineCmd;

/// Represents the kind of failure that happened.
#[derive(Clone, Debug)]
pub enum ErrorKind {
    /// Error occurred while performing I/O on the client socket.
    IoError,
    /// Packet encode error.
    EncodeError,
    /// Packet decode error.
    DecodeError,
    /// Config file could not be parsed.
    ConfigError,
    /// Session with given client id not found.
    SessionNotFound,
    /// Internal mpsc channel error.
    ChannelError,
}

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::IoError, format!("{err}"))
    }
}

impl From<embermq_codec::DecodeError> for Error {
    fn from(err: embermq_codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("{err:?}"))
    }
}

impl From<embermq_codec::EncodeError> for Error {
    fn from(err: embermq_codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("{err:?}"))
    }
}

impl From<mpsc::error::SendError<EngineCmd>> for Error {
    fn from(err: mpsc::error::SendError<EngineCmd>) -> Self {
        Self::from_string(ErrorKind::ChannelError, format!("engine channel closed: {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::from_string(ErrorKind::ConfigError, format!("{err}"))
    }
}
