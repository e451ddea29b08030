//! Plain TCP transport
//!
//! The socket is opened through tokio and then handed over as a
//! non-blocking `std::net::TcpStream`, so reads and writes report
//! `WouldBlock` instead of parking the task.

use super::{Connector, Transport};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use tracing::debug;

pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Resolves the broker address and opens a TCP connection
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn open(&self, server: &str, port: u16) -> io::Result<TcpTransport> {
        debug!("Opening TCP connection to {}:{}", server, port);
        let stream = tokio::net::TcpStream::connect((server, port)).await?;
        TcpTransport::new(stream.into_std()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tcp_transport_is_non_blocking() {
        // Arrange
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        // Act
        let mut transport = TcpConnector.open("127.0.0.1", port).await.unwrap();
        let mut peer = accept.await.unwrap();

        // Assert: nothing to read yet
        let mut buf = [0u8; 4];
        let err = transport.read(&mut buf).unwrap_err();
        assert!(super::super::is_busy(&err));

        tokio::io::AsyncWriteExt::write_all(&mut peer, b"\xd0\x00")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"\xd0\x00");

        transport.close();
        assert!(transport.write(b"x").is_err());
    }
}
