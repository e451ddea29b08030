//! Impure I/O operations for the MQTT engine
//!
//! [`MqttClient`] owns the connection lifecycle: the CONNECT/CONNACK
//! handshake, the background receive and keepalive tasks, QoS 1 delivery
//! with bounded retransmission, and subscribe/unsubscribe round trips.
//! Decisions are delegated to the pure modules next to it.

use super::connection::{
    check_connack, check_connack_header, check_connack_length, connect_options, ConnectionState,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, KeepalivePolicy};
use super::message_handler::{EventRoute, MessageHandler, MessageListener};
use super::tracker::{AckResult, InFlightPublish, PendingKind, Tracker};
use crate::config::MqttSection;
use crate::error::{ErrorKind, MqttError, MqttResult};
use crate::lifecycle_span;
use crate::protocol::codec::ProtocolError;
use crate::protocol::packets::{self, ConnAck, Incoming, Publish};
use crate::protocol::topics::{validate_topic_filter, validate_topic_name};
use crate::protocol::QoS;
use crate::transport::buffer::{BufferStats, Link, LivenessClock};
use crate::transport::Connector;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn, Instrument};

/// Pause between polls of an idle connection in the receive loop
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Pause after the throwaway clean session before the unclean connect
pub const CLEAN_INIT_PAUSE: Duration = Duration::from_secs(2);

/// `broker_up` trusts any byte received within this window
const RECENT_RX_WINDOW: Duration = Duration::from_secs(1);

const BROKER_UP_POLL: Duration = Duration::from_millis(100);

/// Device-side MQTT 3.1.1 engine
pub struct MqttClient<C: Connector> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Connector> {
    config: MqttSection,
    connector: C,
    listener: Arc<dyn MessageListener>,
    link: Mutex<Option<Link<C::Transport>>>,
    tracker: std::sync::Mutex<Tracker>,
    state_tx: watch::Sender<ConnectionState>,
    liveness: Arc<LivenessClock>,
    ping_interval: Duration,
    has_connected: AtomicBool,
    republish_count: AtomicU64,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Connector> MqttClient<C> {
    /// Engine for `config`; options outside the protocol limits are rejected
    pub fn new(
        config: MqttSection,
        connector: C,
        listener: Arc<dyn MessageListener>,
    ) -> MqttResult<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let ping_interval = config.ping_interval()?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                connector,
                listener,
                link: Mutex::new(None),
                tracker: std::sync::Mutex::new(Tracker::new()),
                state_tx,
                liveness: Arc::new(LivenessClock::new()),
                ping_interval,
                has_connected: AtomicBool::new(false),
                republish_count: AtomicU64::new(0),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &MqttSection {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn liveness(&self) -> &LivenessClock {
        &self.shared.liveness
    }

    pub fn ping_interval(&self) -> Duration {
        self.shared.ping_interval
    }

    /// Number of QoS 1 frames resent with the DUP flag
    pub fn republish_count(&self) -> u64 {
        self.shared.republish_count.load(Ordering::Relaxed)
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.tracker().in_flight_count()
    }

    /// Buffer sizes of the open connection, `None` while disconnected
    pub async fn buffer_stats(&self) -> Option<BufferStats> {
        self.shared.link.lock().await.as_ref().map(Link::stats)
    }

    /// Whether the configured ping interval has been exceeded four times over
    pub fn is_stale(&self) -> bool {
        KeepalivePolicy::is_stale(self.shared.liveness.elapsed(), self.shared.ping_interval)
    }

    /// Connect using the configured clean-session flag
    pub async fn connect(&self) -> MqttResult<()> {
        self.connect_with(self.shared.config.clean_session).await
    }

    pub async fn connect_with(&self, clean_session: bool) -> MqttResult<()> {
        let span = lifecycle_span!(
            event = "connect",
            client_id = %self.shared.config.client_id,
            clean_session
        );
        Shared::connect(&self.shared, clean_session)
            .instrument(span)
            .await
    }

    /// Send DISCONNECT (best effort), stop background tasks and close
    pub async fn disconnect(&self) {
        self.shared.abort_tasks();
        if let Some(mut link) = self.shared.link.lock().await.take() {
            if self.is_connected() {
                if let Err(e) = link
                    .send_with(|out| {
                        packets::disconnect(out);
                        Ok(())
                    })
                    .await
                {
                    debug!("DISCONNECT not sent: {}", e);
                }
            }
            link.close();
        }
        self.shared.transition(ConnectionEvent::DisconnectRequested);
        self.shared.tracker().fail_all();
    }

    /// Tear the connection down after a detected failure
    pub async fn force_disconnect(&self, reason: &str) {
        self.shared.force_disconnect(reason).await;
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
        qos: QoS,
    ) -> MqttResult<()> {
        if qos == QoS::ExactlyOnce {
            return Err(MqttError::UnsupportedQoS(qos.level()));
        }
        validate_topic_name(topic)?;
        self.shared.ensure_connected()?;

        match qos {
            QoS::AtMostOnce => {
                let frame = Publish {
                    topic,
                    payload,
                    qos,
                    retain,
                    dup: false,
                    pid: None,
                };
                self.shared.send(|out| frame.encode(out)).await
            }
            _ => self.publish_acknowledged(topic, payload, retain).await,
        }
    }

    async fn publish_acknowledged(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> MqttResult<()> {
        let shared = &self.shared;
        let (pid, mut ack) = shared.tracker().begin(PendingKind::Publish, topic)?;
        let payload = Bytes::copy_from_slice(payload);
        let mut message = InFlightPublish::new(pid, topic, payload, retain);
        let max_attempts = shared.config.max_publish_attempts;
        let response_time = shared.config.response_time();

        loop {
            if let Err(e) = shared.send(|out| message.frame().encode(out)).await {
                shared.tracker().abandon(pid);
                return Err(e);
            }
            message.record_attempt();

            match timeout(response_time, &mut ack).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(_)) => return Err(MqttError::ConnectionClosed),
                Err(_) if message.is_exhausted(max_attempts) => {
                    shared.tracker().abandon(pid);
                    let reason = format!(
                        "no PUBACK for {} after {} attempts",
                        pid, message.attempts
                    );
                    shared.force_disconnect(&reason).await;
                    return Err(MqttError::DeliveryFailed {
                        pid,
                        attempts: message.attempts,
                    });
                }
                Err(_) => {
                    shared.republish_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "No PUBACK for {} within {:?}, retransmitting (attempt {} of {})",
                        pid,
                        response_time,
                        message.attempts + 1,
                        max_attempts
                    );
                }
            }
        }
    }

    pub async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()> {
        if qos == QoS::ExactlyOnce {
            return Err(MqttError::UnsupportedQoS(qos.level()));
        }
        validate_topic_filter(topic)?;
        self.shared.ensure_connected()?;

        let (pid, ack) = self.shared.tracker().begin(PendingKind::Subscribe, topic)?;
        let sent = self
            .shared
            .send(|out| packets::subscribe(out, pid, &[(topic, qos)]))
            .await;
        self.shared.await_ack(pid, PendingKind::Subscribe, sent, ack).await?;
        info!("Subscribed to {} (QoS {})", topic, qos.level());
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> MqttResult<()> {
        validate_topic_filter(topic)?;
        self.shared.ensure_connected()?;

        let (pid, ack) = self
            .shared
            .tracker()
            .begin(PendingKind::Unsubscribe, topic)?;
        let sent = self
            .shared
            .send(|out| packets::unsubscribe(out, pid, &[topic]))
            .await;
        self.shared
            .await_ack(pid, PendingKind::Unsubscribe, sent, ack)
            .await?;
        info!("Unsubscribed from {}", topic);
        Ok(())
    }

    /// Whether the broker is answering
    ///
    /// Any byte in the last second counts; otherwise a PINGREQ is sent and
    /// any inbound byte within the response time counts.
    pub async fn broker_up(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let last = self.shared.liveness.last_rx();
        if last.elapsed() < RECENT_RX_WINDOW {
            return true;
        }
        if self.shared.send(ping).await.is_err() {
            return false;
        }

        let started = Instant::now();
        while started.elapsed() <= self.shared.config.response_time() {
            sleep(BROKER_UP_POLL).await;
            if self.shared.liveness.last_rx() > last {
                return true;
            }
        }
        false
    }
}

impl<C: Connector> Drop for MqttClient<C> {
    fn drop(&mut self) {
        self.shared.abort_tasks();
    }
}

fn ping(out: &mut BytesMut) -> Result<(), ProtocolError> {
    packets::pingreq(out);
    Ok(())
}

impl<C: Connector> Shared<C> {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn ensure_connected(&self) -> MqttResult<()> {
        let state = self.state();
        if !HealthMonitor::can_send(state) {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }

    /// Apply a state change; returns false when the state was already there
    fn transition(&self, event: ConnectionEvent) -> bool {
        let next = HealthMonitor::determine_next_state(&event);
        let mut previous = None;
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            previous = Some(*state);
            *state = next;
            true
        });

        match previous {
            Some(from) => {
                HealthMonitor::log_state_transition(from, next, &event);
                true
            }
            None => false,
        }
    }

    fn abort_tasks(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    async fn connect(self: &Arc<Self>, clean_session: bool) -> MqttResult<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.abort_tasks();
        if let Some(mut stale) = self.link.lock().await.take() {
            stale.close();
        }
        self.transition(ConnectionEvent::HandshakeStarted);

        let link = match self.establish(clean_session).await {
            Ok(link) => link,
            Err(e) => {
                self.transition(ConnectionEvent::HandshakeFailed(e.to_string()));
                return Err(e);
            }
        };

        self.tracker().fail_all();
        self.liveness.touch();
        *self.link.lock().await = Some(link);
        self.has_connected.store(true, Ordering::SeqCst);
        self.transition(ConnectionEvent::ConnAckAccepted);

        let receiver = tokio::spawn(Self::receive_loop(Arc::clone(self)));
        let keepalive = tokio::spawn(Self::keepalive_loop(Arc::clone(self)));
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend([receiver, keepalive]);

        info!(
            "Connected to {}:{} as {} (ping every {:?})",
            self.config.server,
            self.config.port(),
            self.config.client_id,
            self.ping_interval
        );
        Ok(())
    }

    async fn establish(&self, clean_session: bool) -> MqttResult<Link<C::Transport>> {
        let first_connect = !self.has_connected.load(Ordering::SeqCst);
        if first_connect && self.config.clean_init && !clean_session {
            let mut link = self.handshake(true).await?;
            if let Err(e) = link
                .send_with(|out| {
                    packets::disconnect(out);
                    Ok(())
                })
                .await
            {
                debug!("DISCONNECT after clean session not sent: {}", e);
            }
            link.close();
            info!("Cleared previous session, reconnecting with persistent session");
            sleep(CLEAN_INIT_PAUSE).await;
        }
        self.handshake(clean_session).await
    }

    async fn handshake(&self, clean_session: bool) -> MqttResult<Link<C::Transport>> {
        let response_time = self.config.response_time();
        let transport = timeout(
            response_time,
            self.connector.open(&self.config.server, self.config.port()),
        )
        .await
        .map_err(|_| MqttError::Timeout(response_time))??;

        let mut link = Link::new(
            transport,
            Arc::clone(&self.liveness),
            response_time,
            self.config.max_packet_size,
            self.state_tx.subscribe(),
        );
        match Self::exchange_connect(&mut link, &self.config, clean_session).await {
            Ok(()) => Ok(link),
            Err(e) => {
                link.close();
                Err(e)
            }
        }
    }

    async fn exchange_connect(
        link: &mut Link<C::Transport>,
        config: &MqttSection,
        clean_session: bool,
    ) -> MqttResult<()> {
        let options = connect_options(config, clean_session)?;
        link.send_with(|out| packets::connect(out, &options)).await?;
        debug!("CONNECT sent, awaiting CONNACK");

        let header = link.read_exact(1).await?[0];
        check_connack_header(header).map_err(MqttError::ConnectionRejected)?;
        let remaining = link.read_remaining_length().await?;
        check_connack_length(remaining).map_err(MqttError::ConnectionRejected)?;
        let connack = ConnAck::parse(link.read_exact(2).await?)?;
        check_connack(connack).map_err(MqttError::ConnectionRejected)
    }

    /// Write one frame, tearing the connection down on transport failure
    async fn send<F>(&self, build: F) -> MqttResult<()>
    where
        F: FnOnce(&mut BytesMut) -> Result<(), ProtocolError>,
    {
        let result = {
            let mut guard = self.link.lock().await;
            match guard.as_mut() {
                Some(link) => link.send_with(build).await,
                None => Err(MqttError::NotConnected {
                    state: self.state(),
                }),
            }
        };

        if let Err(e) = &result {
            if e.kind() == ErrorKind::Transport {
                self.force_disconnect(&e.to_string()).await;
            }
        }
        result
    }

    /// Wait for the acknowledgment of a subscribe or unsubscribe
    async fn await_ack(
        &self,
        pid: u16,
        kind: PendingKind,
        sent: MqttResult<()>,
        ack: oneshot::Receiver<AckResult>,
    ) -> MqttResult<()> {
        if let Err(e) = sent {
            self.tracker().abandon(pid);
            return Err(e);
        }

        let response_time = self.config.response_time();
        match timeout(response_time, ack).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MqttError::ConnectionClosed),
            Err(_) => {
                self.tracker().abandon(pid);
                let reason = format!(
                    "no {} for {} within {:?}",
                    kind.ack_name(),
                    pid,
                    response_time
                );
                self.force_disconnect(&reason).await;
                Err(MqttError::Timeout(response_time))
            }
        }
    }

    async fn force_disconnect(&self, reason: &str) {
        if !self.transition(ConnectionEvent::ConnectionLost(reason.to_string())) {
            return;
        }
        self.tracker().fail_all();
        if let Some(mut link) = self.link.lock().await.take() {
            link.close();
        }
    }

    async fn receive_loop(shared: Arc<Self>) {
        trace!("Receive loop started");
        while shared.state().is_connected() {
            let outcome = {
                let mut guard = shared.link.lock().await;
                let Some(link) = guard.as_mut() else {
                    break;
                };
                Self::poll_inbound(&shared, link).await
            };

            match outcome {
                Ok(true) => tokio::task::yield_now().await,
                Ok(false) => sleep(RECEIVE_POLL_INTERVAL).await,
                Err(e) => {
                    error!("Receive loop failed: {}", e);
                    shared.force_disconnect(&e.to_string()).await;
                    break;
                }
            }
        }
        trace!("Receive loop stopped");
    }

    /// Process at most one inbound packet; `Ok(false)` when none is waiting
    async fn poll_inbound(shared: &Self, link: &mut Link<C::Transport>) -> MqttResult<bool> {
        let Some(header) = link.try_read_byte()? else {
            return Ok(false);
        };
        let body = link.read_body().await?;
        let incoming = Incoming::parse(header, body)?;

        let puback = match MessageHandler::route_packet(incoming) {
            EventRoute::Acknowledge {
                pid,
                kind,
                failure_code,
            } => {
                trace!("{} for {}", kind.ack_name(), pid);
                shared.tracker().acknowledge(pid, kind, failure_code)?;
                None
            }
            EventRoute::Deliver {
                topic,
                payload,
                retained,
                ack_pid,
            } => {
                debug!(
                    "Message on {} ({} bytes, retained: {})",
                    topic,
                    payload.len(),
                    retained
                );
                shared.listener.on_message(topic, payload, retained);
                ack_pid
            }
            EventRoute::PingResponse => {
                trace!("PINGRESP");
                None
            }
            EventRoute::Violation(e) => return Err(e.into()),
        };

        if let Some(pid) = puback {
            link.send_with(|out| {
                packets::puback(out, pid);
                Ok(())
            })
            .await?;
        }
        Ok(true)
    }

    async fn keepalive_loop(shared: Arc<Self>) {
        let interval = shared.ping_interval;
        while shared.state().is_connected() {
            let silence = shared.liveness.elapsed();
            if KeepalivePolicy::is_stale(silence, interval) {
                warn!("Nothing received for {:?}, broker presumed dead", silence);
                shared.force_disconnect("keepalive expired").await;
                return;
            }

            sleep(interval).await;
            if !shared.state().is_connected() {
                return;
            }
            if let Err(e) = shared.send(ping).await {
                warn!("PINGREQ failed: {}", e);
                shared.force_disconnect(&e.to_string()).await;
                return;
            }
            trace!("PINGREQ sent");
        }
    }
}
