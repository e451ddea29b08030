//! MQTT 3.1.1 client engine
//!
//! The engine separates pure decision logic from I/O so the decisions can be
//! tested without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection states, CONNACK checks and CONNECT options
//! - [`message_handler`] - Pure routing of inbound packets and message listeners
//! - [`health_monitor`] - Pure keepalive, staleness and backoff policies
//! - [`tracker`] - Packet id allocation and acknowledgment correlation
//! - [`client`] - Impure I/O operations and background tasks
//! - [`reconnect`] - Reconnection controller driven by a periodic tick
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_edge::config::ClientConfig;
//! use mqtt_edge::protocol::QoS;
//! use mqtt_edge::transport::mqtt::{MessageQueue, MqttClient, ReconnectController};
//! use mqtt_edge::transport::TcpConnector;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::new("broker.local", "dev-1");
//! let inbox = Arc::new(MessageQueue::new(16));
//! let client = MqttClient::new(config.mqtt.clone(), TcpConnector, inbox.clone())?;
//! let controller = ReconnectController::new(client, config.backoff_policy());
//!
//! controller.tick().await;
//! if controller.take_reconnected() {
//!     controller.client().subscribe("cmd/dev-1", QoS::AtMostOnce).await?;
//! }
//! controller.client().publish("status/dev-1", b"up", false, QoS::AtLeastOnce).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod reconnect;
pub mod tracker;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{ConnectionState, RejectReason};
pub use health_monitor::{
    BackoffPolicy, ConnectionEvent, HealthMonitor, KeepalivePolicy, ReconnectionDecision,
};
pub use message_handler::{
    EventRoute, InboundMessage, MessageHandler, MessageListener, MessageQueue,
};
pub use reconnect::{ReconnectController, TickOutcome};
pub use tracker::{InFlightPublish, PendingKind, PidGenerator, Tracker};
