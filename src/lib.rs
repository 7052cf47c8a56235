//! Multiplexed, bidirectional event messaging over a single long-lived
//! transport connection.
//!
//! One physical connection carries many logical scopes:
//!
//! * [`Namespace`]: a named channel; each connection may hold one [`Socket`]
//!   per namespace. Namespaces can also be spawned on demand from a
//!   [`ParentNamespace`] template matched by name.
//! * [`Socket`]: the endpoint of one namespace on one [`Client`], with typed
//!   event handlers, room membership, acknowledgements, per-event and
//!   per-connection middleware.
//! * Rooms: named socket groups fanned out to by the [`Adapter`]; swap the
//!   in-memory [`MemoryAdapter`] for a distributed implementation to span
//!   nodes.
//!
//! The transport itself (websocket, long-polling, ...) stays outside the
//! crate behind the [`Connection`] and [`TransportServer`] traits: it hands
//! new connections to [`Server::connection`] and feeds each returned
//! [`Client`] with frames and lifecycle events.
//!
//! ```
//! use muxio::{Ack, Server};
//!
//! let server = Server::new();
//! server.of("/chat").on_connect(|socket, _: ()| async move {
//!     socket.join("lobby").await.ok();
//!     socket.on("message", |socket, text: String, _bin| async move {
//!         socket.to("lobby").emit("message", text).await.ok();
//!         Ok(Ack::<()>::None)
//!     });
//! });
//! ```

pub mod adapter;
mod client;
mod errors;
pub mod extensions;
mod handler;
mod handshake;
mod ns;
pub mod operators;
mod packet;
mod parent_ns;
mod server;
mod sid;
mod socket;
pub mod transport;

pub use adapter::{Adapter, BroadcastFlags, BroadcastOptions, MemoryAdapter, Room};
pub use client::Client;
pub use errors::{AckError, BroadcastError, Error, SendError};
pub use extensions::Extensions;
pub use handler::{Ack, AckResponse};
pub use handshake::Handshake;
pub use ns::Namespace;
pub use operators::{Operators, RoomParam};
pub use packet::{BinaryPacket, Packet, PacketData};
pub use parent_ns::{NsMatcher, ParentNamespace, ParentOperators};
pub use server::Server;
pub use sid::Sid;
pub use socket::{DisconnectReason, Socket, RESERVED_EVENTS};
pub use transport::{Connection, Frame, ReadyState, TransportServer, WriteOptions};
