// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Sans-I/O MQTT wire codec: decode bytes into [`packet::Packet`]s and
//! encode responses back into bytes, for protocol levels 3.1, 3.1.1 and 5.
//! Nothing in this crate touches a socket, a clock or a thread; the broker
//! crate owns all of that.

pub mod byte_array;
pub mod error;
pub mod header;
pub mod message;
pub mod packet;
pub mod properties;
pub mod topic;
pub mod utils;
pub mod v3;
pub mod v5;
pub mod var_int;

pub use byte_array::ByteArray;
pub use error::{DecodeError, EncodeError};
pub use header::{FixedHeader, PacketId, PacketTypeCode, ProtocolVersion, QoS};
pub use message::Message;
pub use packet::{
    encode_ack, encode_connack, encode_disconnect, encode_pingresp, encode_publish, encode_suback, encode_unsuback,
    AckBody, ConnAckBody, ConnectBody, ConnectReason, DisconnectBody, EncodedAck, Packet, Reader, SubAckBody,
    SubscribeBody, SubscribeFilter, UnsubAckBody, UnsubscribeBody, Will,
};
pub use properties::Properties;
pub use topic::{parse_filter, topic_matches_filter, validate_topic_filter, validate_topic_name, ParsedFilter};
pub use utils::random_client_id;
pub use var_int::{VarInt, MAX_REMAINING_LENGTH};
