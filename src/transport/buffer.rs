//! I/O buffering over a non-blocking transport
//!
//! A [`Link`] owns the transport for one connection together with a single
//! reusable receive buffer and a reusable transmit buffer. Reads and writes
//! poll the transport, pausing briefly while it is busy, and give up once no
//! progress has been made for the configured response time.

use super::{is_busy, Transport};
use crate::error::{MqttError, MqttResult};
use crate::protocol::codec::{ProtocolError, VarintDecoder};
use crate::transport::mqtt::connection::ConnectionState;
use bytes::BytesMut;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

/// Pause between polls of a busy transport
pub const IO_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Extra room added whenever the receive buffer has to grow
const GROWTH_SLACK: usize = 50;

const INITIAL_CAPACITY: usize = 64;

/// Growable receive buffer that is reused for every read
///
/// It grows only when a single requested field does not fit and never
/// shrinks, so steady traffic performs no further allocation.
#[derive(Debug)]
pub struct ReceiveBuffer {
    buf: Vec<u8>,
    grow_count: usize,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            grow_count: 0,
        }
    }

    /// Make room for a field of `n` bytes
    pub fn reserve_field(&mut self, n: usize) {
        if n > self.buf.len() {
            self.buf.resize(n + GROWTH_SLACK, 0);
            self.grow_count += 1;
        }
    }

    /// Mutable view of the first `n` bytes, growing if needed
    pub fn claim(&mut self, n: usize) -> &mut [u8] {
        self.reserve_field(n);
        &mut self.buf[..n]
    }

    pub fn filled(&self, n: usize) -> &[u8] {
        &self.buf[..n]
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of times the buffer had to be enlarged
    pub fn grow_count(&self) -> usize {
        self.grow_count
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a link's buffer sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub rx_capacity: usize,
    pub rx_grows: usize,
    pub tx_capacity: usize,
    pub tx_grows: usize,
}

/// Time of the last byte received from the broker
#[derive(Debug)]
pub struct LivenessClock {
    last_rx: Mutex<Instant>,
}

impl LivenessClock {
    pub fn new() -> Self {
        Self {
            last_rx: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        self.set_last_rx(Instant::now());
    }

    pub fn set_last_rx(&self, at: Instant) {
        if let Ok(mut last) = self.last_rx.lock() {
            *last = at;
        }
    }

    pub fn last_rx(&self) -> Instant {
        self.last_rx
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_rx())
    }
}

impl Default for LivenessClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One open connection: transport plus its buffers
pub struct Link<T: Transport> {
    transport: T,
    rx: ReceiveBuffer,
    tx: BytesMut,
    tx_grows: usize,
    liveness: std::sync::Arc<LivenessClock>,
    response_time: Duration,
    max_packet_size: usize,
    state: watch::Receiver<ConnectionState>,
}

impl<T: Transport> Link<T> {
    pub fn new(
        transport: T,
        liveness: std::sync::Arc<LivenessClock>,
        response_time: Duration,
        max_packet_size: usize,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            transport,
            rx: ReceiveBuffer::new(),
            tx: BytesMut::with_capacity(INITIAL_CAPACITY),
            tx_grows: 0,
            liveness,
            response_time,
            max_packet_size,
            state,
        }
    }

    pub fn receive_buffer(&self) -> &ReceiveBuffer {
        &self.rx
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            rx_capacity: self.rx.capacity(),
            rx_grows: self.rx.grow_count(),
            tx_capacity: self.tx.capacity(),
            tx_grows: self.tx_grows,
        }
    }

    /// I/O stops as soon as the engine has declared the connection down
    fn check_open(&self) -> MqttResult<()> {
        if *self.state.borrow() == ConnectionState::Disconnected {
            return Err(MqttError::ConnectionClosed);
        }
        Ok(())
    }

    /// Read a single byte if one is available right now
    pub fn try_read_byte(&mut self) -> MqttResult<Option<u8>> {
        self.check_open()?;
        match self.transport.read(self.rx.claim(1)) {
            Ok(0) => Err(MqttError::ConnectionClosed),
            Ok(_) => {
                self.liveness.touch();
                Ok(Some(self.rx.filled(1)[0]))
            }
            Err(e) if is_busy(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read exactly `n` bytes into the receive buffer
    pub async fn read_exact(&mut self, n: usize) -> MqttResult<&[u8]> {
        self.rx.reserve_field(n);
        let mut filled = 0;
        let mut last_progress = Instant::now();

        while filled < n {
            self.check_open()?;
            if last_progress.elapsed() > self.response_time {
                return Err(MqttError::Timeout(self.response_time));
            }
            match self.transport.read(&mut self.rx.claim(n)[filled..]) {
                Ok(0) => return Err(MqttError::ConnectionClosed),
                Ok(count) => {
                    filled += count;
                    last_progress = Instant::now();
                    self.liveness.touch();
                    tokio::task::yield_now().await;
                }
                Err(e) if is_busy(&e) => tokio::time::sleep(IO_POLL_INTERVAL).await,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.rx.filled(n))
    }

    pub async fn read_remaining_length(&mut self) -> MqttResult<u32> {
        let mut decoder = VarintDecoder::new();
        loop {
            let byte = self.read_exact(1).await?[0];
            if let Some((value, _)) = decoder.push(byte)? {
                return Ok(value);
            }
        }
    }

    /// Read the remaining length and body of a packet whose header is consumed
    pub async fn read_body(&mut self) -> MqttResult<&[u8]> {
        let len = self.read_remaining_length().await? as usize;
        if len > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: len,
                max: self.max_packet_size,
            }
            .into());
        }
        trace!("Reading {} byte packet body", len);
        self.read_exact(len).await
    }

    /// Encode a frame into the transmit buffer and write it out
    pub async fn send_with<F>(&mut self, build: F) -> MqttResult<()>
    where
        F: FnOnce(&mut BytesMut) -> Result<(), ProtocolError>,
    {
        let capacity = self.tx.capacity();
        self.tx.clear();
        build(&mut self.tx)?;
        self.note_tx_growth(capacity);
        self.flush_tx().await
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> MqttResult<()> {
        let capacity = self.tx.capacity();
        self.tx.clear();
        self.tx.extend_from_slice(bytes);
        self.note_tx_growth(capacity);
        self.flush_tx().await
    }

    fn note_tx_growth(&mut self, previous: usize) {
        if self.tx.capacity() > previous {
            self.tx_grows += 1;
        }
    }

    async fn flush_tx(&mut self) -> MqttResult<()> {
        let mut written = 0;
        let mut last_progress = Instant::now();

        while written < self.tx.len() {
            self.check_open()?;
            if last_progress.elapsed() > self.response_time {
                return Err(MqttError::Timeout(self.response_time));
            }
            match self.transport.write(&self.tx[written..]) {
                Ok(0) => tokio::time::sleep(IO_POLL_INTERVAL).await,
                Ok(count) => {
                    written += count;
                    last_progress = Instant::now();
                    tokio::task::yield_now().await;
                }
                Err(e) if is_busy(&e) => tokio::time::sleep(IO_POLL_INTERVAL).await,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.transport.close();
    }
}
