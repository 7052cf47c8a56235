//! Contracts of the transport collaborators.
//!
//! The crate never opens sockets itself: a transport layer (long-polling,
//! websocket, in-process stub, ...) owns the physical connections and drives
//! a [`Client`](crate::Client) with the frames it receives. These traits are
//! the whole seam between the two.

use std::net::SocketAddr;

/// A single frame on the wire. Packet heads are text; binary attachments
/// follow as separate binary frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Connection lifecycle as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Per-write options forwarded to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub compress: bool,
}

/// One long-lived transport connection.
///
/// The transport delivers inbound traffic by calling
/// [`Client::on_data`](crate::Client::on_data),
/// [`Client::on_error`](crate::Client::on_error) and
/// [`Client::on_close`](crate::Client::on_close); this trait covers the
/// outbound direction and the connection metadata the core reads.
pub trait Connection: Send + Sync + 'static {
    /// Identifier of this connection, unique within the process.
    fn id(&self) -> &str;

    fn ready_state(&self) -> ReadyState;

    /// Whether a write would currently reach the peer without queueing.
    /// Volatile packets are dropped when this is false.
    fn writable(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Write a single frame. Must not block.
    fn write(&self, frame: Frame, opts: WriteOptions);

    /// Close the connection. The transport reports the closure back through
    /// [`Client::on_close`](crate::Client::on_close).
    fn close(&self);

    /// Parts of the HTTP request that opened the connection; snapshotted into
    /// the [`Handshake`](crate::Handshake) at socket construction.
    fn req_parts(&self) -> &http::request::Parts;

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}


/// Server-side handle on the transport listener.
pub trait TransportServer: Send + Sync + 'static {
    /// Install frames to piggy-back on the handshake response of every new
    /// connection, saving one round trip.
    fn set_initial_packet(&self, frames: Vec<Frame>);

    fn clear_initial_packet(&self);

    /// Stop accepting connections and close the existing ones.
    fn close(&self);
}
