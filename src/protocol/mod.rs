//! MQTT 3.1.1 wire format
//!
//! Pure encoding and decoding with no I/O: primitives in [`codec`], control
//! packets in [`packets`] and topic rules in [`topics`].

pub mod codec;
pub mod packets;
pub mod topics;

pub use codec::ProtocolError;
pub use packets::{ConnectOptions, Incoming, LastWill, PacketType, Publish, QoS};
pub use topics::{validate_topic_filter, validate_topic_name, ValidationError};
