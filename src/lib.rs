//! mqtt-edge
//!
//! A device-side MQTT 3.1.1 client engine for constrained hosts that keep a
//! long-lived broker connection over an unreliable link.
//!
//! # Overview
//!
//! - Byte-exact packet codec and topic validation ([`protocol`])
//! - Non-blocking I/O with a single reusable receive buffer ([`transport`])
//! - Connection lifecycle, QoS 1 delivery with bounded retransmission and
//!   keepalive monitoring ([`transport::mqtt::MqttClient`])
//! - Exponential reconnection backoff ([`transport::mqtt::ReconnectController`])
//! - TOML configuration ([`config`]) and structured logging ([`observability`])
//!
//! # Quick Start
//!
//! ```rust
//! use bytes::BytesMut;
//! use mqtt_edge::protocol::{Publish, QoS};
//!
//! let mut out = BytesMut::new();
//! Publish {
//!     topic: "status/dev-1",
//!     payload: b"up",
//!     qos: QoS::AtLeastOnce,
//!     retain: false,
//!     dup: false,
//!     pid: Some(1),
//! }
//! .encode(&mut out)
//! .unwrap();
//!
//! assert_eq!(&out[..4], &[0x32, 0x12, 0x00, 0x0c]);
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError, MqttSection};
pub use error::{ErrorKind, MqttError, MqttResult};
pub use protocol::{QoS, ValidationError};
pub use transport::mqtt::{
    ConnectionState, MessageListener, MessageQueue, MqttClient, ReconnectController, TickOutcome,
};
pub use transport::{TcpConnector, TcpTransport};
