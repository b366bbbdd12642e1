//! Byte-stream transports the listener can accept sessions on
//!
//! TCP (Wi-Fi, or USB through ADB port forwarding) is built in. Bluetooth
//! RFCOMM depends on the platform stack, so it plugs in through
//! [`BluetoothRegistrar`].

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::error::{NetworkError, Result};

/// Anything a session can run over
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// Type-erased session stream
pub type BoxedStream = Box<dyn DuplexStream>;

/// Source of incoming connections
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next peer; returns the stream and a printable peer label
    async fn accept(&mut self) -> Result<(BoxedStream, String)>;

    /// Printable description of where we listen
    fn local_label(&self) -> String;
}

/// Registers the RFCOMM service with the platform Bluetooth stack
#[async_trait]
pub trait BluetoothRegistrar: Send + Sync {
    /// Make the service discoverable and return an acceptor for it
    async fn register(&self, service_name: &str, service_uuid: &str) -> Result<Box<dyn Acceptor>>;
}

/// Listening TCP socket
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    /// Bind with `SO_REUSEADDR` so a restarted listener can reclaim the port
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let bind_failed = |e: std::io::Error| {
            let reason = if e.kind() == std::io::ErrorKind::AddrInUse {
                format!("port {} is already in use", addr.port())
            } else {
                e.to_string()
            };
            NetworkError::BindFailed {
                addr: addr.to_string(),
                reason,
            }
        };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_failed)?;
        socket.set_reuse_address(true).map_err(bind_failed)?;
        socket.set_nonblocking(true).map_err(bind_failed)?;
        socket.bind(&addr.into()).map_err(bind_failed)?;
        socket.listen(1).map_err(bind_failed)?;

        let listener = TcpListener::from_std(socket.into()).map_err(bind_failed)?;
        let local_addr = listener.local_addr().map_err(bind_failed)?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Actual bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<(BoxedStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_label(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_tcp_accept() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr();
        assert_ne!(addr.port(), 0);
        assert!(acceptor.local_label().starts_with("tcp://127.0.0.1:"));

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let (mut stream, peer) = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(peer.starts_with("127.0.0.1:"));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_port() {
        let first = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr();

        match TcpAcceptor::bind(taken) {
            Err(Error::Network(NetworkError::BindFailed { addr, .. })) => {
                assert_eq!(addr, taken.to_string());
            }
            Err(other) => panic!("unexpected error: {}", other),
            // some platforms let SO_REUSEADDR share a listening port
            Ok(_) => {}
        }
    }
}
