//! Transport layer for the MQTT engine
//!
//! The engine talks to the network through a non-blocking duplex byte stream
//! supplied by a [`Connector`]. Reads and writes either make progress, report
//! end of stream, or fail with a "busy" error that means "try again later".

use std::io;

pub mod buffer;
pub mod mqtt;
pub mod tcp;

/// Non-blocking duplex byte stream
///
/// `read` returning `Ok(0)` means the peer closed the stream. `write`
/// returning `Ok(0)` means nothing could be written yet. Errors for which
/// [`is_busy`] holds are retried after a short pause.
pub trait Transport: Send + 'static {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self);
}

/// Opens transports to the broker
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    async fn open(&self, server: &str, port: u16) -> io::Result<Self::Transport>;
}

/// Errors that mean "no data yet" rather than failure
pub fn is_busy(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

pub use buffer::{BufferStats, Link, LivenessClock, ReceiveBuffer};
pub use tcp::{TcpConnector, TcpTransport};
