//! Error taxonomy for the MQTT engine
//!
//! Every fallible engine operation returns [`MqttResult`]. Errors fall into
//! four kinds: transport failures and protocol violations (both of which end
//! the current connection), delivery failures reported to the caller, and
//! configuration errors rejected at the call site.

use crate::config::ConfigError;
use crate::protocol::{ProtocolError, ValidationError};
use crate::transport::mqtt::connection::{ConnectionState, RejectReason};
use std::time::Duration;
use thiserror::Error;

pub type MqttResult<T> = Result<T, MqttError>;

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("No progress within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection rejected: {0}")]
    ConnectionRejected(RejectReason),

    #[error("Subscription to '{topic}' rejected with code {code:#04x}")]
    SubscriptionRejected { topic: String, code: u8 },

    #[error("Unsubscribe from '{topic}' rejected with code {code:#04x}")]
    UnsubscribeRejected { topic: String, code: u8 },

    #[error("Publish {pid} rejected with reason code {code:#04x}")]
    PublishRejected { pid: u16, code: u8 },

    #[error("QoS {0} is not supported")]
    UnsupportedQoS(u8),

    #[error("Delivery of packet {pid} failed after {attempts} attempts")]
    DeliveryFailed { pid: u16, attempts: u32 },

    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Coarse classification used for logging and recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Delivery,
    Configuration,
}

impl MqttError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MqttError::Timeout(_) | MqttError::ConnectionClosed | MqttError::Transport(_) => {
                ErrorKind::Transport
            }
            MqttError::Protocol(_)
            | MqttError::ConnectionRejected(_)
            | MqttError::SubscriptionRejected { .. }
            | MqttError::UnsubscribeRejected { .. }
            | MqttError::PublishRejected { .. } => ErrorKind::Protocol,
            MqttError::DeliveryFailed { .. } | MqttError::NotConnected { .. } => {
                ErrorKind::Delivery
            }
            MqttError::UnsupportedQoS(_) | MqttError::InvalidTopic(_) | MqttError::Config(_) => {
                ErrorKind::Configuration
            }
        }
    }

    /// Whether the engine tears the connection down when it sees this error.
    ///
    /// Broker refusals carried in a well-formed acknowledgment (SUBACK,
    /// UNSUBACK or PUBACK failure codes) leave the stream in sync and only
    /// fail the waiting operation. An unanswered publish does not: the
    /// broker is presumed gone.
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            MqttError::Timeout(_)
            | MqttError::ConnectionClosed
            | MqttError::Transport(_)
            | MqttError::Protocol(_)
            | MqttError::ConnectionRejected(_)
            | MqttError::DeliveryFailed { .. } => true,
            MqttError::SubscriptionRejected { .. }
            | MqttError::UnsubscribeRejected { .. }
            | MqttError::PublishRejected { .. }
            | MqttError::UnsupportedQoS(_)
            | MqttError::NotConnected { .. }
            | MqttError::InvalidTopic(_)
            | MqttError::Config(_) => false,
        }
    }
}
