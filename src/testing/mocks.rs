//! Mock implementations for testing
//!
//! [`MockBroker`] is a scripted in-memory broker. It decodes the frames the
//! client writes using the crate codec, records them, and answers according
//! to a handful of knobs (CONNACK code, dropped PUBACKs, ping replies, ...).
//! [`MockConnector`] hands out [`MockTransport`]s bound to it.

use crate::config::{ClientConfig, MqttSection};
use crate::protocol::codec::{ProtocolError, VarintDecoder};
use crate::protocol::packets::{PacketType, Publish};
use crate::protocol::QoS;
use crate::transport::mqtt::MessageListener;
use crate::transport::{Connector, Transport};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

/// A frame written by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFrame {
    pub header: u8,
    pub body: Vec<u8>,
}

impl ClientFrame {
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_header(self.header)
    }

    pub fn as_publish(&self) -> Option<Publish<'_>> {
        match self.packet_type() {
            Some(PacketType::Publish) => Publish::parse(self.header, &self.body).ok(),
            _ => None,
        }
    }

    /// Packet id of a SUBSCRIBE or UNSUBSCRIBE
    pub fn request_pid(&self) -> Option<u16> {
        match self.packet_type() {
            Some(PacketType::Subscribe | PacketType::Unsubscribe) if self.body.len() >= 2 => {
                Some(u16::from_be_bytes([self.body[0], self.body[1]]))
            }
            _ => None,
        }
    }
}

/// Owned copy of a PUBLISH the client sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub pid: Option<u16>,
}

#[derive(Debug)]
struct BrokerState {
    connack_code: u8,
    connack_flags: u8,
    ack_publishes: bool,
    pubacks_to_drop: usize,
    suback_code: Option<u8>,
    ack_subscriptions: bool,
    respond_to_pings: bool,
    refuse_connections: bool,
    eof: bool,
    connect_count: usize,
    session: u64,
    frames: Vec<ClientFrame>,
    from_client: Vec<u8>,
    to_client: VecDeque<u8>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            connack_code: 0,
            connack_flags: 0,
            ack_publishes: true,
            pubacks_to_drop: 0,
            suback_code: None,
            ack_subscriptions: true,
            respond_to_pings: true,
            refuse_connections: false,
            eof: false,
            connect_count: 0,
            session: 0,
            frames: Vec::new(),
            from_client: Vec::new(),
            to_client: VecDeque::new(),
        }
    }
}

impl BrokerState {
    fn reply(&mut self, bytes: &[u8]) {
        self.to_client.extend(bytes);
    }

    /// Split complete frames off the client byte stream
    fn drain_frames(&mut self) -> Result<(), ProtocolError> {
        loop {
            let mut decoder = VarintDecoder::new();
            let mut length = None;
            for &byte in self.from_client.iter().skip(1) {
                if let Some(done) = decoder.push(byte)? {
                    length = Some(done);
                    break;
                }
            }
            let Some((len, consumed)) = length else {
                return Ok(());
            };
            let total = 1 + consumed + len as usize;
            if self.from_client.len() < total {
                return Ok(());
            }

            let frame: Vec<u8> = self.from_client.drain(..total).collect();
            let frame = ClientFrame {
                header: frame[0],
                body: frame[1 + consumed..].to_vec(),
            };
            self.respond(&frame);
            self.frames.push(frame);
        }
    }

    fn respond(&mut self, frame: &ClientFrame) {
        match frame.packet_type() {
            Some(PacketType::Connect) => {
                self.connect_count += 1;
                let reply = [
                    PacketType::ConnAck.header(),
                    0x02,
                    self.connack_flags,
                    self.connack_code,
                ];
                self.reply(&reply);
            }
            Some(PacketType::Publish) => {
                let pid = frame.as_publish().and_then(|publish| publish.pid);
                if let Some(pid) = pid.filter(|_| self.ack_publishes) {
                    if self.pubacks_to_drop > 0 {
                        self.pubacks_to_drop -= 1;
                    } else {
                        let [hi, lo] = pid.to_be_bytes();
                        self.reply(&[PacketType::PubAck.header(), 0x02, hi, lo]);
                    }
                }
            }
            Some(PacketType::Subscribe) if self.ack_subscriptions => {
                let Some(pid) = frame.request_pid() else {
                    return;
                };
                // Last byte of the single-filter body is the requested QoS
                let granted = frame.body.last().copied().unwrap_or(0);
                let code = self.suback_code.unwrap_or(granted);
                let [hi, lo] = pid.to_be_bytes();
                self.reply(&[PacketType::SubAck.header(), 0x03, hi, lo, code]);
            }
            Some(PacketType::Unsubscribe) if self.ack_subscriptions => {
                if let Some(pid) = frame.request_pid() {
                    let [hi, lo] = pid.to_be_bytes();
                    self.reply(&[PacketType::UnsubAck.header(), 0x02, hi, lo]);
                }
            }
            Some(PacketType::PingReq) if self.respond_to_pings => {
                self.reply(&[PacketType::PingResp.header(), 0x00]);
            }
            _ => {}
        }
    }
}

/// Scripted in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    pub fn set_connack_code(&self, code: u8) {
        self.state().connack_code = code;
    }

    pub fn set_connack_flags(&self, flags: u8) {
        self.state().connack_flags = flags;
    }

    /// Swallow the next `count` PUBACKs
    pub fn drop_pubacks(&self, count: usize) {
        self.state().pubacks_to_drop = count;
    }

    pub fn set_ack_publishes(&self, ack: bool) {
        self.state().ack_publishes = ack;
    }

    /// Answer every SUBSCRIBE with `code` instead of the requested QoS
    pub fn set_suback_code(&self, code: u8) {
        self.state().suback_code = Some(code);
    }

    pub fn set_ack_subscriptions(&self, ack: bool) {
        self.state().ack_subscriptions = ack;
    }

    pub fn set_respond_to_pings(&self, respond: bool) {
        self.state().respond_to_pings = respond;
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Report end of stream once queued bytes are consumed
    pub fn close_stream(&self) {
        self.state().eof = true;
    }

    /// Queue raw bytes for the client
    pub fn inject(&self, bytes: &[u8]) {
        self.state().reply(bytes);
    }

    pub fn inject_publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        pid: Option<u16>,
    ) {
        let mut out = BytesMut::new();
        let frame = Publish {
            topic,
            payload,
            qos,
            retain,
            dup: false,
            pid,
        };
        if frame.encode(&mut out).is_ok() {
            self.inject(&out);
        }
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_count
    }

    pub fn frames(&self) -> Vec<ClientFrame> {
        self.state().frames.clone()
    }

    pub fn frames_of(&self, packet_type: PacketType) -> Vec<ClientFrame> {
        self.state()
            .frames
            .iter()
            .filter(|frame| frame.packet_type() == Some(packet_type))
            .cloned()
            .collect()
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.state()
            .frames
            .iter()
            .filter_map(ClientFrame::as_publish)
            .map(|publish| PublishRecord {
                topic: publish.topic.to_string(),
                payload: publish.payload.to_vec(),
                qos: publish.qos,
                retain: publish.retain,
                dup: publish.dup,
                pid: publish.pid,
            })
            .collect()
    }

    pub fn clear_frames(&self) {
        self.state().frames.clear();
    }

    fn open_session(&self) -> io::Result<u64> {
        let mut state = self.state();
        if state.refuse_connections {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        state.session += 1;
        state.eof = false;
        state.from_client.clear();
        state.to_client.clear();
        Ok(state.session)
    }
}

/// Opens [`MockTransport`]s to a [`MockBroker`]
#[derive(Debug, Clone)]
pub struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn open(&self, _server: &str, _port: u16) -> io::Result<MockTransport> {
        let session = self.broker.open_session()?;
        Ok(MockTransport {
            broker: self.broker.clone(),
            session,
            closed: false,
        })
    }
}

/// Non-blocking transport backed by a [`MockBroker`]
///
/// A transport from an earlier session reads end of stream.
#[derive(Debug)]
pub struct MockTransport {
    broker: MockBroker,
    session: u64,
    closed: bool,
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut state = self.broker.state();
        if state.session != self.session {
            return Ok(0);
        }
        if state.to_client.is_empty() {
            if state.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.to_client.len());
        for (slot, byte) in buf.iter_mut().zip(state.to_client.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut state = self.broker.state();
        if state.session != self.session || state.eof {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.from_client.extend_from_slice(buf);
        state
            .drain_frames()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Listener that records every delivered message
#[derive(Debug, Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<(String, Vec<u8>, bool)>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>, bool)> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().map(|messages| messages.len()).unwrap_or(0)
    }
}

impl MessageListener for RecordingListener {
    fn on_message(&self, topic: &str, payload: &[u8], retained: bool) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((topic.to_string(), payload.to_vec(), retained));
        }
    }
}

/// Engine settings for tests, without the clean-init pause
pub fn mock_config(client_id: &str) -> MqttSection {
    let mut config = ClientConfig::new("broker.test", client_id).mqtt;
    config.clean_init = false;
    config
}
