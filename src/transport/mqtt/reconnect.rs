//! Reconnection and backoff controller
//!
//! Driven by a periodic tick from the owning application loop. Any
//! disconnect schedules an attempt after an exponential backoff delay; a
//! successful attempt resets the backoff and raises a one-shot
//! "reconnected" flag telling the application to subscribe again.

use super::client::MqttClient;
use super::health_monitor::{BackoffPolicy, HealthMonitor, ReconnectionDecision};
use crate::error::MqttError;
use crate::lifecycle_span;
use crate::transport::Connector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

/// Result of one controller tick
#[derive(Debug)]
pub enum TickOutcome {
    /// Connected and live; nothing to do
    Connected,
    /// Another tick is running a connection attempt
    AlreadyInProgress,
    /// Disconnect noticed; first attempt scheduled after `delay`
    Scheduled { delay: Duration },
    /// An attempt is scheduled but not yet due
    Waiting { remaining: Duration },
    /// The attempt succeeded
    Reconnected,
    Failed {
        error: MqttError,
        next_delay: Duration,
    },
    /// Shutdown was requested; no further attempts are made
    Stopped,
}

enum Liveness {
    Live,
    Scheduled(Duration),
    Down,
}

#[derive(Debug)]
struct BackoffState {
    failures: u32,
    next_attempt_at: Option<Instant>,
}

/// Clears the single-flight flag when the attempt ends
struct AttemptGuard<'a>(&'a AtomicBool);

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ReconnectController<C: Connector> {
    client: MqttClient<C>,
    policy: BackoffPolicy,
    backoff: Mutex<BackoffState>,
    in_progress: AtomicBool,
    reconnected: AtomicBool,
    shutdown: AtomicBool,
}

impl<C: Connector> ReconnectController<C> {
    /// The first tick connects immediately
    pub fn new(client: MqttClient<C>, policy: BackoffPolicy) -> Self {
        Self {
            client,
            policy,
            backoff: Mutex::new(BackoffState {
                failures: 0,
                next_attempt_at: Some(Instant::now()),
            }),
            in_progress: AtomicBool::new(false),
            reconnected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &MqttClient<C> {
        &self.client
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    fn backoff(&self) -> MutexGuard<'_, BackoffState> {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.backoff().failures
    }

    /// Time until the scheduled attempt, if one is scheduled
    pub fn next_attempt_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.backoff()
            .next_attempt_at
            .map(|at| at.saturating_duration_since(now))
    }

    /// Consume the "reconnected" flag
    pub fn take_reconnected(&self) -> bool {
        self.reconnected.swap(false, Ordering::SeqCst)
    }

    /// Schedule an attempt unless one already is; returns the delay
    fn schedule(&self) -> Option<Duration> {
        let mut state = self.backoff();
        if state.next_attempt_at.is_some() {
            return None;
        }
        let decision = HealthMonitor::should_attempt_reconnection(
            state.failures,
            &self.policy,
            self.shutdown.load(Ordering::SeqCst),
        );
        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                state.next_attempt_at = Some(Instant::now() + delay);
                info!("Reconnection attempt {} in {:?}", attempt, delay);
                Some(delay)
            }
            ReconnectionDecision::AbortShutdownRequested => None,
        }
    }

    /// Check liveness before a send
    ///
    /// A stale connection is torn down and a reconnect scheduled. Returns
    /// whether the connection may be used.
    pub async fn ensure_connected(&self) -> bool {
        matches!(self.check_liveness().await, Liveness::Live)
    }

    async fn check_liveness(&self) -> Liveness {
        if self.client.is_connected() {
            if !self.client.is_stale() {
                return Liveness::Live;
            }
            warn!(
                "No traffic for {:?}, dropping connection",
                self.client.liveness().elapsed()
            );
            self.client.force_disconnect("keepalive expired").await;
        }
        match self.schedule() {
            Some(delay) => Liveness::Scheduled(delay),
            None => Liveness::Down,
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        if self.shutdown.load(Ordering::SeqCst) {
            return TickOutcome::Stopped;
        }
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return TickOutcome::AlreadyInProgress;
        }
        let _guard = AttemptGuard(&self.in_progress);

        match self.check_liveness().await {
            Liveness::Live => return TickOutcome::Connected,
            Liveness::Scheduled(delay) => return TickOutcome::Scheduled { delay },
            Liveness::Down => {}
        }

        let attempt = {
            let state = self.backoff();
            let now = Instant::now();
            match state.next_attempt_at {
                None => return TickOutcome::Stopped,
                Some(at) if at > now => {
                    return TickOutcome::Waiting {
                        remaining: at - now,
                    }
                }
                Some(_) => state.failures + 1,
            }
        };

        let span = lifecycle_span!(event = "reconnect", attempt);
        match self.client.connect().instrument(span).await {
            Ok(()) => {
                {
                    let mut state = self.backoff();
                    state.failures = 0;
                    state.next_attempt_at = None;
                }
                self.reconnected.store(true, Ordering::SeqCst);
                TickOutcome::Reconnected
            }
            Err(error) => {
                let failures = {
                    let mut state = self.backoff();
                    state.failures += 1;
                    state.next_attempt_at = None;
                    state.failures
                };
                match self.schedule() {
                    Some(next_delay) => {
                        warn!(
                            "Connection attempt {} failed: {} (retry in {:?})",
                            failures, error, next_delay
                        );
                        TickOutcome::Failed { error, next_delay }
                    }
                    None => TickOutcome::Stopped,
                }
            }
        }
    }

    /// Stop reconnecting and disconnect cleanly
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.backoff().next_attempt_at = None;
        self.client.disconnect().await;
    }
}
