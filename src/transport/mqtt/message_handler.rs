//! Pure routing of inbound packets and the application-facing listeners
//!
//! The receive loop parses a packet and asks [`MessageHandler`] what it
//! means: an acknowledgment to correlate, a message to deliver, a ping
//! response, or a violation that ends the connection.

use super::tracker::PendingKind;
use crate::protocol::codec::ProtocolError;
use crate::protocol::packets::{Incoming, PacketType};
use crate::protocol::QoS;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Receives every inbound PUBLISH
pub trait MessageListener: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8], retained: bool);
}

impl<F> MessageListener for F
where
    F: Fn(&str, &[u8], bool) + Send + Sync,
{
    fn on_message(&self, topic: &str, payload: &[u8], retained: bool) {
        self(topic, payload, retained)
    }
}

/// Filters carried by each SUBSCRIBE or UNSUBSCRIBE the client sends
pub const FILTERS_PER_REQUEST: usize = 1;

/// Pure routing decisions for inbound packets
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_packet(incoming: Incoming<'_>) -> EventRoute<'_> {
        match incoming {
            Incoming::PubAck(ack) => EventRoute::Acknowledge {
                pid: ack.pid,
                kind: PendingKind::Publish,
                failure_code: ack.reason_code.filter(|code| *code >= 0x80),
            },
            Incoming::SubAck(ack) => match ack.expect_codes(FILTERS_PER_REQUEST) {
                Ok(ack) => EventRoute::Acknowledge {
                    pid: ack.pid,
                    kind: PendingKind::Subscribe,
                    failure_code: Self::first_failure(ack.return_codes),
                },
                Err(e) => EventRoute::Violation(e),
            },
            Incoming::UnsubAck(ack) => match ack.expect_codes(FILTERS_PER_REQUEST) {
                Ok(ack) => EventRoute::Acknowledge {
                    pid: ack.pid,
                    kind: PendingKind::Unsubscribe,
                    failure_code: Self::first_failure(ack.reason_codes),
                },
                Err(e) => EventRoute::Violation(e),
            },
            Incoming::Publish(publish) => EventRoute::Deliver {
                topic: publish.topic,
                payload: publish.payload,
                retained: publish.retain,
                ack_pid: match publish.qos {
                    QoS::AtMostOnce => None,
                    _ => publish.pid,
                },
            },
            Incoming::PingResp => EventRoute::PingResponse,
            Incoming::ConnAck(_) => EventRoute::Violation(ProtocolError::UnexpectedPacket(
                PacketType::ConnAck.header(),
            )),
        }
    }

    /// First reason code signalling failure (0x80 and above)
    pub fn first_failure(codes: &[u8]) -> Option<u8> {
        codes.iter().copied().find(|code| *code >= 0x80)
    }
}

/// What the engine must do with an inbound packet
#[derive(Debug, PartialEq)]
pub enum EventRoute<'a> {
    /// Resolve the request waiting on `pid`
    Acknowledge {
        pid: u16,
        kind: PendingKind,
        failure_code: Option<u8>,
    },
    /// Hand a message to the listener, then PUBACK `ack_pid` if present
    Deliver {
        topic: &'a str,
        payload: &'a [u8],
        retained: bool,
        ack_pid: Option<u16>,
    },
    PingResponse,
    Violation(ProtocolError),
}

/// A message held by [`MessageQueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retained: bool,
}

struct QueueState {
    items: VecDeque<InboundMessage>,
    discards: u64,
}

/// Bounded listener that keeps the newest messages
///
/// When full, the oldest queued message is dropped and counted as a discard.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                discards: 0,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    pub fn push(&self, message: InboundMessage) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.items.len() == self.capacity {
            state.items.pop_front();
            state.discards += 1;
            warn!(
                "Message queue full, discarded oldest message ({} discards)",
                state.discards
            );
        }
        state.items.push_back(message);
        drop(state);
        self.notify.notify_one();
    }

    pub fn try_recv(&self) -> Option<InboundMessage> {
        self.state.lock().ok()?.items.pop_front()
    }

    /// Wait for the next message
    pub async fn recv(&self) -> InboundMessage {
        loop {
            if let Some(message) = self.try_recv() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn discards(&self) -> u64 {
        self.state.lock().map(|state| state.discards).unwrap_or(0)
    }
}

impl MessageListener for MessageQueue {
    fn on_message(&self, topic: &str, payload: &[u8], retained: bool) {
        debug!("Queueing message on {}", topic);
        self.push(InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            retained,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packets::{ConnAck, PubAck, Publish, SubAck, UnsubAck};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_route_acknowledgments() {
        assert_eq!(
            MessageHandler::route_packet(Incoming::PubAck(PubAck {
                pid: 3,
                reason_code: None
            })),
            EventRoute::Acknowledge {
                pid: 3,
                kind: PendingKind::Publish,
                failure_code: None
            }
        );
        // MQTT 5 success reason codes below 0x80 are not failures
        assert_eq!(
            MessageHandler::route_packet(Incoming::PubAck(PubAck {
                pid: 3,
                reason_code: Some(0x10)
            })),
            EventRoute::Acknowledge {
                pid: 3,
                kind: PendingKind::Publish,
                failure_code: None
            }
        );
        assert_eq!(
            MessageHandler::route_packet(Incoming::SubAck(SubAck {
                pid: 4,
                return_codes: &[0x80]
            })),
            EventRoute::Acknowledge {
                pid: 4,
                kind: PendingKind::Subscribe,
                failure_code: Some(0x80)
            }
        );
        assert_eq!(
            MessageHandler::route_packet(Incoming::UnsubAck(UnsubAck {
                pid: 5,
                reason_codes: &[]
            })),
            EventRoute::Acknowledge {
                pid: 5,
                kind: PendingKind::Unsubscribe,
                failure_code: None
            }
        );
    }

    #[test]
    fn test_ack_with_extra_codes_is_a_violation() {
        assert_eq!(
            MessageHandler::route_packet(Incoming::SubAck(SubAck {
                pid: 4,
                return_codes: &[0x00, 0x01]
            })),
            EventRoute::Violation(ProtocolError::LengthMismatch {
                packet: "SUBACK",
                expected: 3,
                actual: 4
            })
        );
        assert!(matches!(
            MessageHandler::route_packet(Incoming::UnsubAck(UnsubAck {
                pid: 5,
                reason_codes: &[0x00, 0x00]
            })),
            EventRoute::Violation(_)
        ));
    }

    #[test]
    fn test_route_publish_and_others() {
        let publish = Publish {
            topic: "cmd/dev-1",
            payload: b"on",
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            pid: Some(9),
        };
        assert_eq!(
            MessageHandler::route_packet(Incoming::Publish(publish)),
            EventRoute::Deliver {
                topic: "cmd/dev-1",
                payload: b"on",
                retained: false,
                ack_pid: Some(9)
            }
        );
        assert_eq!(
            MessageHandler::route_packet(Incoming::PingResp),
            EventRoute::PingResponse
        );
        assert_eq!(
            MessageHandler::route_packet(Incoming::ConnAck(ConnAck {
                flags: 0,
                return_code: 0
            })),
            EventRoute::Violation(ProtocolError::UnexpectedPacket(0x20))
        );
    }

    #[test]
    fn test_closure_listener() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let listener = move |_: &str, payload: &[u8], _: bool| {
            seen.fetch_add(payload.len(), Ordering::SeqCst);
        };

        listener.on_message("t", b"abc", false);

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_queue_discards_oldest_when_full() {
        let queue = MessageQueue::new(2);
        queue.on_message("a", b"1", false);
        queue.on_message("b", b"2", false);
        queue.on_message("c", b"3", true);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.discards(), 1);
        assert_eq!(queue.try_recv().unwrap().topic, "b");
        let last = queue.try_recv().unwrap();
        assert_eq!(last.topic, "c");
        assert!(last.retained);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_recv_waits_for_message() {
        let queue = Arc::new(MessageQueue::new(4));
        let producer = queue.clone();

        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            producer.on_message("cmd/dev-1", b"on", false);
        });

        let message = queue.recv().await;
        handle.await.unwrap();
        assert_eq!(message.topic, "cmd/dev-1");
        assert_eq!(&message.payload[..], b"on");
    }
}
