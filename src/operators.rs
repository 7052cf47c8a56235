use std::sync::Arc;

use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::adapter::{Adapter, BroadcastFlags, BroadcastOptions, Room};
use crate::errors::{AckError, SendError};
use crate::handler::AckResponse;
use crate::ns::Namespace;
use crate::packet::Packet;
use crate::sid::Sid;
use crate::socket::{is_reserved_event, Socket};
use crate::transport::WriteOptions;

/// A trait for types that can be used as a room parameter.
///
/// `String`, `Vec<String>`, `&'static str` and arrays of `&'static str` are
/// implemented by default.
pub trait RoomParam: 'static {
    type IntoIter: Iterator<Item = Room>;
    fn into_room_iter(self) -> Self::IntoIter;
}

impl RoomParam for Room {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self)
    }
}
impl RoomParam for Vec<Room> {
    type IntoIter = std::vec::IntoIter<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter()
    }
}
impl RoomParam for &'static str {
    type IntoIter = std::iter::Once<Room>;
    fn into_room_iter(self) -> Self::IntoIter {
        std::iter::once(self.to_string())
    }
}
impl<const COUNT: usize> RoomParam for [&'static str; COUNT] {
    type IntoIter =
        std::iter::Map<std::array::IntoIter<&'static str, COUNT>, fn(&'static str) -> Room>;

    fn into_room_iter(self) -> Self::IntoIter {
        self.into_iter().map(|s| s.to_string())
    }
}

/// Operators select the sockets a packet goes to and configure how it is
/// written. They are built from a [`Socket`](crate::Socket), a
/// [`Namespace`](crate::Namespace) or the [`Server`](crate::Server) and
/// consumed by a terminal call (`emit`, `sockets`, `join`, ...).
#[derive(Debug)]
pub struct Operators<A: Adapter> {
    opts: BroadcastOptions,
    ns: Arc<Namespace<A>>,
    binary: Vec<Vec<u8>>,
    binary_flag: Option<bool>,
}

impl<A: Adapter> Operators<A> {
    pub(crate) fn new(ns: Arc<Namespace<A>>, sid: Option<Sid>) -> Self {
        Self {
            opts: BroadcastOptions::new(sid),
            ns,
            binary: vec![],
            binary_flag: None,
        }
    }

    /// Select all sockets in the given rooms, except the current socket.
    ///
    /// Use `within()` to include the current socket. From the namespace level
    /// the two are identical.
    pub fn to(mut self, rooms: impl RoomParam) -> Self {
        self.opts.rooms.extend(rooms.into_room_iter().unique());
        self.opts.flags.insert(BroadcastFlags::Broadcast);
        self
    }

    /// Select all sockets in the given rooms, the current socket included.
    pub fn within(mut self, rooms: impl RoomParam) -> Self {
        self.opts.rooms.extend(rooms.into_room_iter().unique());
        self
    }

    /// Filter out all sockets selected with the previous operators that are
    /// in the given rooms.
    pub fn except(mut self, rooms: impl RoomParam) -> Self {
        self.opts.except.extend(rooms.into_room_iter().unique());
        self.opts.flags.insert(BroadcastFlags::Broadcast);
        self
    }

    /// Broadcast only to sockets connected to this node (a no-op with the
    /// in-memory adapter).
    pub fn local(mut self) -> Self {
        self.opts.flags.insert(BroadcastFlags::Local);
        self
    }

    /// Broadcast to all sockets of the namespace, except the current socket.
    pub fn broadcast(mut self) -> Self {
        self.opts.flags.insert(BroadcastFlags::Broadcast);
        self
    }

    /// Drop the packet for targets whose transport is not currently writable
    /// instead of queueing it.
    pub fn volatile(mut self) -> Self {
        self.opts.flags.insert(BroadcastFlags::Volatile);
        self
    }

    /// Ask the transport to compress the written frames.
    pub fn compress(mut self, compress: bool) -> Self {
        if compress {
            self.opts.flags.insert(BroadcastFlags::Compress);
        } else {
            self.opts.flags.remove(&BroadcastFlags::Compress);
        }
        self
    }

    /// Force (true) or suppress (false) binary framing, overriding the
    /// structural detection based on attached payloads.
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary_flag = Some(binary);
        self
    }

    /// Attach binary payloads to the message.
    pub fn bin(mut self, binary: Vec<Vec<u8>>) -> Self {
        self.binary = binary;
        self
    }

    /// Emit a message to all sockets selected with the previous operators.
    ///
    /// Without staged rooms or the broadcast flag this is a direct write to
    /// the current socket's connection; otherwise the packet is encoded once
    /// and fanned out by the namespace adapter, never back to the sender.
    /// Reserved event names are raised locally and produce no wire packet.
    pub async fn emit(
        mut self,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<(), serde_json::Error> {
        let event = event.into();
        if is_reserved_event(&event) {
            let data = serde_json::to_value(data)?;
            match self.current_socket() {
                Some(socket) => socket.dispatch_local(&event, data),
                None => warn!("reserved event {event:?} dropped at the namespace level"),
            }
            return Ok(());
        }
        let packet = self.get_packet(event, data)?;
        if self.is_direct() {
            if let Some(socket) = self.current_socket() {
                let volatile = self.opts.flags.contains(&BroadcastFlags::Volatile);
                let opts = WriteOptions {
                    compress: self.opts.flags.contains(&BroadcastFlags::Compress),
                };
                if let Err(_e) = socket.send_packet_with_opts(packet, opts, volatile) {
                    debug!("emit dropped: {_e:?}");
                }
            }
            return Ok(());
        }
        let Operators { opts, ns, .. } = self;
        if let Err(_e) = ns.adapter().broadcast(packet, opts).await {
            debug!("broadcast error: {_e:?}");
        }
        Ok(())
    }

    /// Emit a message to the current socket and wait for its acknowledgement.
    ///
    /// Fails with [`AckError::BroadcastAck`] when rooms or the broadcast flag
    /// are staged: acknowledgements are only defined towards a single peer.
    pub async fn emit_with_ack<V: DeserializeOwned>(
        mut self,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<AckResponse<V>, AckError> {
        let event = event.into();
        if !self.is_direct() {
            return Err(AckError::BroadcastAck);
        }
        if is_reserved_event(&event) {
            return Err(AckError::ReservedEvent);
        }
        let packet = self
            .get_packet(event, data)
            .map_err(SendError::Serialize)?;
        let socket = self.current_socket().ok_or(AckError::SocketClosed)?;
        let rx = socket.send_with_ack(packet)?;
        let (v, bin) = rx.await?;
        Ok((serde_json::from_value(v)?, bin))
    }

    /// Get all sockets selected with the previous operators.
    pub async fn sockets(self) -> Result<Vec<Arc<Socket<A>>>, A::Error> {
        self.ns.adapter().fetch_sockets(self.opts).await
    }

    /// Disconnect all sockets selected with the previous operators from
    /// their namespace.
    pub async fn disconnect(self) -> Result<(), A::Error> {
        self.ns.adapter().disconnect_sockets(self.opts).await
    }

    /// Make all selected sockets join the given rooms.
    pub async fn join(self, rooms: impl RoomParam) -> Result<(), A::Error> {
        self.ns
            .adapter()
            .add_sockets(self.opts, rooms.into_room_iter().collect())
            .await
    }

    /// Make all selected sockets leave the given rooms.
    pub async fn leave(self, rooms: impl RoomParam) -> Result<(), A::Error> {
        self.ns
            .adapter()
            .del_sockets(self.opts, rooms.into_room_iter().collect())
            .await
    }

    /// No rooms and no broadcast flag: the emit goes straight to the current
    /// socket's connection instead of through the adapter.
    fn is_direct(&self) -> bool {
        self.opts.sid.is_some()
            && self.opts.rooms.is_empty()
            && !self.opts.flags.contains(&BroadcastFlags::Broadcast)
    }

    fn current_socket(&self) -> Option<Arc<Socket<A>>> {
        self.opts.sid.as_ref().and_then(|sid| self.ns.get_socket(sid))
    }

    /// Create a packet with the given event and data.
    fn get_packet(
        &mut self,
        event: String,
        data: impl Serialize,
    ) -> Result<Packet, serde_json::Error> {
        let ns = self.ns.path.clone();
        let data = serde_json::to_value(data)?;
        let binary = std::mem::take(&mut self.binary);
        let packet = match self.binary_flag {
            Some(true) => Packet::bin_event(ns, event, data, binary),
            Some(false) => Packet::event(ns, event, data),
            None if binary.is_empty() => Packet::event(ns, event, data),
            None => Packet::bin_event(ns, event, data, binary),
        };
        Ok(packet)
    }
}
