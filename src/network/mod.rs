//! Network subsystem: transports, sessions and the listener supervisor

pub mod client;
pub mod handler;
pub mod server;
pub mod transport;

pub use client::StreamClient;
pub use handler::{ConnectionHandler, MuteCallback, SessionStats};
pub use server::{AudioServer, PipelineFactory};
pub use transport::{Acceptor, BluetoothRegistrar, BoxedStream, DuplexStream, TcpAcceptor};
