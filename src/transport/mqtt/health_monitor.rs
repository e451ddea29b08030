//! Pure keepalive, liveness and reconnection logic for the MQTT engine
//!
//! This module contains pure functions for ping scheduling, staleness
//! detection, backoff computation and connection state transitions.

use super::connection::ConnectionState;
use std::time::Duration;
use tracing::{error, info, warn};

/// Missed ping intervals after which a silent connection is presumed dead
pub const STALE_PING_INTERVALS: u32 = 4;

/// Ping interval used when the keepalive is disabled
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Ping scheduling and liveness policy
pub struct KeepalivePolicy;

impl KeepalivePolicy {
    /// A quarter of the keepalive, capped by an explicit configured interval
    pub fn ping_interval(keepalive_secs: u16, configured_secs: u64) -> Duration {
        let derived = if keepalive_secs == 0 {
            DEFAULT_PING_INTERVAL
        } else {
            Duration::from_millis(u64::from(keepalive_secs) * 1000 / 4)
        };
        let configured = Duration::from_secs(configured_secs);
        if !configured.is_zero() && configured < derived {
            configured
        } else {
            derived
        }
    }

    pub fn stale_threshold(ping_interval: Duration) -> Duration {
        ping_interval * STALE_PING_INTERVALS
    }

    /// Whether the time since the last received byte means the link is dead
    pub fn is_stale(since_last_rx: Duration, ping_interval: Duration) -> bool {
        since_last_rx >= Self::stale_threshold(ping_interval)
    }
}

/// Exponential reconnection backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine whether and when the next reconnection attempt should run
    pub fn should_attempt_reconnection(
        consecutive_failures: u32,
        policy: &BackoffPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        ReconnectionDecision::Proceed {
            attempt: consecutive_failures + 1,
            delay: policy.delay_for(consecutive_failures),
        }
    }

    /// Determine next state after connection event
    pub fn determine_next_state(event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::HandshakeStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckAccepted => ConnectionState::Connected,
            ConnectionEvent::HandshakeFailed(_)
            | ConnectionEvent::ConnectionLost(_)
            | ConnectionEvent::DisconnectRequested => ConnectionState::Disconnected,
        }
    }

    /// Check if connection state allows publishing and subscribing
    pub fn can_send(state: ConnectionState) -> bool {
        state.is_connected()
    }

    /// Log connection state transition
    pub fn log_state_transition(
        from: ConnectionState,
        to: ConnectionState,
        event: &ConnectionEvent,
    ) {
        match (from, to, event) {
            (ConnectionState::Connecting, ConnectionState::Connected, _) => {
                info!("MQTT connection established");
            }
            (
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionEvent::ConnectionLost(reason),
            ) => {
                warn!("MQTT connection lost: {}", reason);
            }
            (_, ConnectionState::Disconnected, ConnectionEvent::HandshakeFailed(reason)) => {
                error!("MQTT handshake failed: {}", reason);
            }
            _ => {
                info!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    HandshakeStarted,
    ConnAckAccepted,
    HandshakeFailed(String),
    /// Transport failure, protocol violation or staleness while connected
    ConnectionLost(String),
    DisconnectRequested,
}
