//! Packet identifier allocation and acknowledgment correlation
//!
//! Every QoS 1 publish, subscribe and unsubscribe registers its packet id
//! here together with a one-shot waiter. Acknowledgments resolve the waiter
//! by pid; an acknowledgment for a pid that is not tracked means the stream
//! is out of sync and is reported as a protocol error.

use crate::error::{MqttError, MqttResult};
use crate::protocol::codec::ProtocolError;
use crate::protocol::packets::Publish;
use crate::protocol::QoS;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Cycles through 1..=65535, never issuing 0
#[derive(Debug, Default, Clone)]
pub struct PidGenerator {
    last: u16,
}

impl PidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_pid(&mut self) -> u16 {
        self.last = if self.last == u16::MAX {
            1
        } else {
            self.last + 1
        };
        self.last
    }
}

impl Iterator for PidGenerator {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        Some(self.next_pid())
    }
}

/// Which request a pid belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl PendingKind {
    /// Name of the acknowledgment that completes this request
    pub fn ack_name(self) -> &'static str {
        match self {
            PendingKind::Publish => "PUBACK",
            PendingKind::Subscribe => "SUBACK",
            PendingKind::Unsubscribe => "UNSUBACK",
        }
    }
}

pub type AckResult = MqttResult<()>;

struct Pending {
    kind: PendingKind,
    topic: String,
    waiter: oneshot::Sender<AckResult>,
}

/// Outstanding requests keyed by packet id
#[derive(Default)]
pub struct Tracker {
    pids: PidGenerator,
    pending: HashMap<u16, Pending>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next pid that is not currently in flight
    pub fn allocate(&mut self) -> Result<u16, ProtocolError> {
        for _ in 0..u16::MAX {
            let pid = self.pids.next_pid();
            if !self.pending.contains_key(&pid) {
                return Ok(pid);
            }
        }
        Err(ProtocolError::PacketIdsExhausted)
    }

    /// Allocate a pid and register a waiter for its acknowledgment
    pub fn begin(
        &mut self,
        kind: PendingKind,
        topic: &str,
    ) -> Result<(u16, oneshot::Receiver<AckResult>), ProtocolError> {
        let pid = self.allocate()?;
        let (waiter, rx) = oneshot::channel();
        self.pending.insert(
            pid,
            Pending {
                kind,
                topic: topic.to_string(),
                waiter,
            },
        );
        Ok((pid, rx))
    }

    /// Resolve the waiter for `pid`
    ///
    /// `failure_code` carries a broker reason code of 0x80 or above; the
    /// waiter then receives the matching rejection error.
    pub fn acknowledge(
        &mut self,
        pid: u16,
        kind: PendingKind,
        failure_code: Option<u8>,
    ) -> Result<(), ProtocolError> {
        let unknown = ProtocolError::UnknownPacketId {
            pid,
            packet: kind.ack_name(),
        };
        let entry = match self.pending.remove(&pid) {
            Some(entry) if entry.kind == kind => entry,
            Some(entry) => {
                self.pending.insert(pid, entry);
                return Err(unknown);
            }
            None => return Err(unknown),
        };

        let outcome = match failure_code {
            None => Ok(()),
            Some(code) => Err(match kind {
                PendingKind::Publish => MqttError::PublishRejected { pid, code },
                PendingKind::Subscribe => MqttError::SubscriptionRejected {
                    topic: entry.topic,
                    code,
                },
                PendingKind::Unsubscribe => MqttError::UnsubscribeRejected {
                    topic: entry.topic,
                    code,
                },
            }),
        };
        // The caller may have given up already
        let _ = entry.waiter.send(outcome);
        Ok(())
    }

    /// Stop tracking `pid` without notifying anyone
    pub fn abandon(&mut self, pid: u16) {
        self.pending.remove(&pid);
    }

    /// Fail every outstanding request with `ConnectionClosed`
    pub fn fail_all(&mut self) {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            let _ = entry.waiter.send(Err(MqttError::ConnectionClosed));
        }
        if count > 0 {
            debug!("Failed {} pending requests on disconnect", count);
        }
    }

    pub fn contains(&self, pid: u16) -> bool {
        self.pending.contains_key(&pid)
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }
}

/// A QoS 1 publish awaiting its PUBACK
#[derive(Debug, Clone)]
pub struct InFlightPublish {
    pub pid: u16,
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub qos: QoS,
    /// Frames sent so far
    pub attempts: u32,
}

impl InFlightPublish {
    pub fn new(pid: u16, topic: &str, payload: Bytes, retain: bool) -> Self {
        Self {
            pid,
            topic: topic.to_string(),
            payload,
            retain,
            qos: QoS::AtLeastOnce,
            attempts: 0,
        }
    }

    /// Frame for the next send; every send after the first carries DUP
    pub fn frame(&self) -> Publish<'_> {
        Publish {
            topic: &self.topic,
            payload: &self.payload,
            qos: self.qos,
            retain: self.retain,
            dup: self.attempts > 0,
            pid: Some(self.pid),
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}
