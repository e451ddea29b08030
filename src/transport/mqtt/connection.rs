//! Pure connection state management for the MQTT engine
//!
//! Connection states, CONNACK validation and the mapping from the engine
//! configuration to CONNECT options. Nothing here performs I/O.

use crate::config::MqttSection;
use crate::error::{MqttError, MqttResult};
use crate::protocol::packets::{ConnAck, ConnectOptions, LastWill, PacketType};
use crate::protocol::QoS;
use std::fmt;
use thiserror::Error;

/// Connection state owned by the lifecycle machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Transport opening or handshake in flight
    Connecting,
    /// CONNACK accepted; background tasks running
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Why a handshake was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("CONNACK not received, got header {0:#04x}")]
    UnexpectedPacket(u8),
    #[error("invalid CONNACK remaining length {0}")]
    InvalidLength(u32),
    #[error("CONNACK flags {0:#04x} not 0")]
    SessionPresent(u8),
    #[error("CONNACK return code {0:#04x} ({desc})", desc = return_code_description(*.0))]
    ReturnCode(u8),
}

/// Human readable meaning of a MQTT 3.1.1 CONNACK return code
pub fn return_code_description(code: u8) -> &'static str {
    match code {
        0x00 => "accepted",
        0x01 => "unacceptable protocol version",
        0x02 => "identifier rejected",
        0x03 => "server unavailable",
        0x04 => "bad user name or password",
        0x05 => "not authorized",
        _ => "unknown",
    }
}

pub fn check_connack_header(header: u8) -> Result<(), RejectReason> {
    if header != PacketType::ConnAck.header() {
        return Err(RejectReason::UnexpectedPacket(header));
    }
    Ok(())
}

pub fn check_connack_length(remaining: u32) -> Result<(), RejectReason> {
    if remaining != 2 {
        return Err(RejectReason::InvalidLength(remaining));
    }
    Ok(())
}

pub fn check_connack(connack: ConnAck) -> Result<(), RejectReason> {
    if connack.flags != 0 {
        return Err(RejectReason::SessionPresent(connack.flags));
    }
    if connack.return_code != 0 {
        return Err(RejectReason::ReturnCode(connack.return_code));
    }
    Ok(())
}

/// Build CONNECT options borrowing from the configuration
pub fn connect_options(
    config: &MqttSection,
    clean_session: bool,
) -> MqttResult<ConnectOptions<'_>> {
    let last_will = match &config.last_will {
        Some(will) => {
            let qos = QoS::from_level(will.qos)
                .filter(|qos| *qos != QoS::ExactlyOnce)
                .ok_or(MqttError::UnsupportedQoS(will.qos))?;
            Some(LastWill {
                topic: &will.topic,
                message: will.message.as_bytes(),
                qos,
                retain: will.retain,
            })
        }
        None => None,
    };

    Ok(ConnectOptions {
        client_id: &config.client_id,
        keepalive: config.keepalive()?,
        clean_session,
        username: config.username.as_deref().filter(|user| !user.is_empty()),
        password: config.password.as_deref().map(str::as_bytes),
        last_will,
    })
}
