//! A [`Socket`] is the endpoint of one namespace on one client connection.
//! It is handed to connect listeners as an `Arc` and used to send and receive
//! events, join and leave rooms and acknowledge messages.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use futures::{Future, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::adapter::{Adapter, MemoryAdapter, Room};
use crate::client::Client;
use crate::errors::{AckError, Error, SendError};
use crate::extensions::Extensions;
use crate::handler::{self, Ack, AckResponse, MessageCaller};
use crate::handshake::Handshake;
use crate::ns::Namespace;
use crate::operators::{Operators, RoomParam};
use crate::packet::{Packet, PacketData};
use crate::sid::Sid;
use crate::transport::{Frame, WriteOptions};

/// Event names owned by the socket lifecycle. They are raised through the
/// local listener registry and never travel the wire as events, in either
/// direction.
pub const RESERVED_EVENTS: &[&str] = &[
    "error",
    "connect",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

pub(crate) fn is_reserved_event(event: &str) -> bool {
    RESERVED_EVENTS.contains(&event)
}

/// All the possible reasons for a [`Socket`] to be detached from its
/// namespace. Listeners for `disconnecting` and `disconnect` receive the
/// `Display` form as their payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The transport connection was closed by the peer.
    TransportClose,

    /// The transport connection failed.
    TransportError,

    /// An inbound frame could not be decoded.
    PacketParsingError,

    /// The peer left this namespace with a DISCONNECT packet.
    ClientNsDisconnect,

    /// The socket was detached server side with [`Socket::disconnect`].
    ServerNsDisconnect,

    /// The whole client connection was torn down server side.
    ForcedClose,

    /// The server is shutting down.
    ClosingServer,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use DisconnectReason::*;
        let str: &'static str = match self {
            TransportClose => "transport close",
            TransportError => "transport error",
            PacketParsingError => "parse error",
            ClientNsDisconnect => "client namespace disconnect",
            ServerNsDisconnect => "server namespace disconnect",
            ForcedClose => "forced server close",
            ClosingServer => "server shutting down",
        };
        f.write_str(str)
    }
}

/// Middleware run for every inbound event before its listener: the chain
/// short-circuits on the first error, which is reported to the peer as an
/// ERROR packet instead of the event delivery.
pub(crate) type EventMiddleware<A> = Arc<
    dyn Fn(
            Arc<Socket<A>>,
            String,
            Value,
        ) -> BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + Sync,
>;

pub struct Socket<A: Adapter = MemoryAdapter> {
    /// The socket id; also the name of the room the socket implicitly joins
    /// on connection.
    pub id: Sid,

    /// Request snapshot captured when the socket was created.
    pub handshake: Handshake,

    /// Socket-scoped shared state.
    pub extensions: Extensions,

    pub(crate) client: Arc<Client<A>>,
    ns: Arc<Namespace<A>>,
    listeners: RwLock<HashMap<String, Arc<dyn MessageCaller<A>>>>,
    middlewares: RwLock<Vec<EventMiddleware<A>>>,
    ack_message: Mutex<HashMap<i64, oneshot::Sender<AckResponse<Value>>>>,
    connected: AtomicBool,
    closing: AtomicBool,
}

impl<A: Adapter> Socket<A> {
    pub(crate) fn new(
        client: Arc<Client<A>>,
        ns: Arc<Namespace<A>>,
        handshake: Handshake,
        id: Sid,
    ) -> Self {
        Self {
            id,
            handshake,
            extensions: Extensions::new(),
            client,
            ns,
            listeners: RwLock::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
            ack_message: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        }
    }

    /// Register a handler for the given event, replacing any previous one.
    ///
    /// The payload is deserialized into the handler's parameter type; binary
    /// attachments are passed through untouched. Returning anything other
    /// than [`Ack::None`] answers the emitter when the event carried an ack
    /// id. Listeners for the lifecycle events `disconnecting`, `disconnect`
    /// and `error` are registered the same way and receive the reason or
    /// error message as their payload.
    ///
    /// ```
    /// # use muxio::{Ack, Server};
    /// let server = Server::new();
    /// server.of("/").on_connect(|socket, _: ()| async move {
    ///     socket.on("ping", |_socket, msg: String, _bin| async move {
    ///         Ok(Ack::Data(format!("pong: {msg}")))
    ///     });
    /// });
    /// ```
    pub fn on<C, F, V, RetV>(&self, event: impl Into<String>, callback: C)
    where
        C: Fn(Arc<Socket<A>>, V, Vec<Vec<u8>>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Ack<RetV>, Error>> + Send + 'static,
        V: DeserializeOwned + Send + Sync + 'static,
        RetV: Serialize + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap()
            .insert(event.into(), handler::boxed(callback));
    }

    /// Remove the handler of the given event.
    pub fn off(&self, event: &str) {
        self.listeners.write().unwrap().remove(event);
    }

    /// Append event middleware of the form `(socket, event, payload)`.
    pub fn use_middleware<F, Fut>(&self, mw: F)
    where
        F: Fn(Arc<Socket<A>>, String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'static,
    {
        let mw: EventMiddleware<A> = Arc::new(move |s, e, v| mw(s, e, v).boxed());
        self.middlewares.write().unwrap().push(mw);
    }

    /// Emit an event to the peer.
    ///
    /// Reserved event names are raised on the local listener registry instead
    /// of producing a wire packet.
    pub fn emit(
        self: &Arc<Self>,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<(), SendError> {
        let event = event.into();
        let data = serde_json::to_value(data)?;
        if is_reserved_event(&event) {
            self.dispatch_local(&event, data);
            return Ok(());
        }
        self.send_packet(Packet::event(self.ns.path.clone(), event, data))
    }

    /// Alias for `emit("message", data)`.
    pub fn send(self: &Arc<Self>, data: impl Serialize) -> Result<(), SendError> {
        self.emit("message", data)
    }

    /// Alias for [`Socket::send`].
    pub fn write(self: &Arc<Self>, data: impl Serialize) -> Result<(), SendError> {
        self.send(data)
    }

    /// Emit an event and wait for the peer's acknowledgement.
    ///
    /// The returned future resolves when the ack arrives or the socket
    /// closes; this layer applies no deadline, wrap the future if one is
    /// needed.
    pub async fn emit_with_ack<V: DeserializeOwned>(
        self: &Arc<Self>,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<AckResponse<V>, AckError> {
        let event = event.into();
        if is_reserved_event(&event) {
            return Err(AckError::ReservedEvent);
        }
        let data = serde_json::to_value(data).map_err(SendError::Serialize)?;
        let packet = Packet::event(self.ns.path.clone(), event, data);
        let rx = self.send_with_ack(packet)?;
        let (v, bin) = rx.await?;
        Ok((serde_json::from_value(v)?, bin))
    }

    // Room actions

    /// Join the given rooms, creating them on demand.
    pub async fn join(&self, rooms: impl RoomParam) -> Result<(), A::Error> {
        self.ns
            .adapter()
            .add_all(self.id.clone(), rooms.into_room_iter().collect())
            .await
    }

    /// Leave the given rooms; unknown rooms are ignored.
    pub async fn leave(&self, rooms: impl RoomParam) -> Result<(), A::Error> {
        self.ns
            .adapter()
            .del(&self.id, rooms.into_room_iter().collect())
            .await
    }

    /// Leave every room the socket belongs to.
    pub async fn leave_all(&self) -> Result<(), A::Error> {
        self.ns.adapter().del_all(&self.id).await
    }

    /// The rooms the socket currently belongs to.
    pub async fn rooms(&self) -> Result<std::collections::HashSet<Room>, A::Error> {
        self.ns.adapter().socket_rooms(&self.id).await
    }

    // Socket operators

    /// Select all sockets in the given rooms, excluding this one.
    pub fn to(&self, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id.clone())).to(rooms)
    }

    /// Select all sockets in the given rooms, this one included.
    pub fn within(&self, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id.clone())).within(rooms)
    }

    /// Filter out the sockets that are in the given rooms.
    pub fn except(&self, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id.clone())).except(rooms)
    }

    /// Do not forward the next broadcast to peer nodes.
    pub fn local(&self) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id.clone())).local()
    }

    /// Broadcast to the whole namespace, excluding this socket.
    pub fn broadcast(&self) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id.clone())).broadcast()
    }

    /// Drop the next emit instead of queueing when the transport is not
    /// writable.
    pub fn volatile(&self) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id.clone())).volatile()
    }

    /// Ask the transport to compress the frames of the next emit.
    pub fn compress(&self, compress: bool) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id.clone())).compress(compress)
    }

    /// Force (or suppress) binary framing for the next emit, overriding the
    /// structural detection.
    pub fn binary(&self, binary: bool) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id.clone())).binary(binary)
    }

    /// Attach binary payloads to the next emit.
    pub fn bin(&self, binary: Vec<Vec<u8>>) -> Operators<A> {
        Operators::new(self.ns.clone(), Some(self.id.clone())).bin(binary)
    }

    /// Detach the socket from its namespace: the peer is notified with a
    /// DISCONNECT packet and the local teardown runs. Other namespaces on the
    /// same connection stay usable.
    pub async fn disconnect(self: &Arc<Self>) -> Result<(), SendError> {
        self.send_packet(Packet::disconnect(self.ns.path.clone()))?;
        self.close(DisconnectReason::ServerNsDisconnect).await;
        Ok(())
    }

    /// Tear down the whole client connection, every namespace included.
    pub async fn disconnect_all(self: &Arc<Self>) {
        self.client.disconnect().await;
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> bool {
        !self.connected()
    }

    /// Path of the namespace this socket belongs to.
    pub fn ns(&self) -> &str {
        &self.ns.path
    }

    // Outbound plumbing

    pub(crate) fn send_packet(&self, packet: Packet) -> Result<(), SendError> {
        self.send_packet_with_opts(packet, WriteOptions::default(), false)
    }

    pub(crate) fn send_packet_with_opts(
        &self,
        packet: Packet,
        opts: WriteOptions,
        volatile: bool,
    ) -> Result<(), SendError> {
        if !self.connected() {
            return Err(SendError::SocketClosed);
        }
        self.client.write_packet(packet, opts, volatile)
    }

    /// Write frames already encoded by an adapter broadcast.
    pub(crate) fn send_frames(
        &self,
        frames: Vec<Frame>,
        opts: WriteOptions,
        volatile: bool,
    ) -> Result<(), SendError> {
        if !self.connected() {
            return Err(SendError::SocketClosed);
        }
        self.client.write_raw(frames, opts, volatile);
        Ok(())
    }

    pub(crate) fn send_with_ack(
        &self,
        mut packet: Packet,
    ) -> Result<oneshot::Receiver<AckResponse<Value>>, SendError> {
        let (tx, rx) = oneshot::channel();
        let ack = self.ns.next_ack_id();
        packet.inner.set_ack_id(ack);
        self.ack_message.lock().unwrap().insert(ack, tx);
        if let Err(e) = self.send_packet(packet) {
            self.ack_message.lock().unwrap().remove(&ack);
            return Err(e);
        }
        Ok(rx)
    }

    pub(crate) fn send_ack(&self, ack_id: i64, data: impl Serialize) -> Result<(), SendError> {
        let data = serde_json::to_value(data)?;
        self.send_packet(Packet::ack(self.ns.path.clone(), data, ack_id))
    }

    pub(crate) fn send_bin_ack(
        &self,
        ack_id: i64,
        data: impl Serialize,
        bin: Vec<Vec<u8>>,
    ) -> Result<(), SendError> {
        let data = serde_json::to_value(data)?;
        self.send_packet(Packet::bin_ack(self.ns.path.clone(), data, bin, ack_id))
    }

    // Inbound dispatch

    pub(crate) async fn recv(self: &Arc<Self>, packet: PacketData) {
        match packet {
            PacketData::Event(e, data, ack) => self.recv_event(e, data, vec![], ack).await,
            PacketData::BinaryEvent(e, packet, ack) => {
                self.recv_event(e, packet.data, packet.bin, ack).await
            }
            PacketData::EventAck(data, ack) => self.recv_ack(data, vec![], ack),
            PacketData::BinaryAck(packet, ack) => self.recv_ack(packet.data, packet.bin, ack),
            PacketData::Disconnect => self.close(DisconnectReason::ClientNsDisconnect).await,
            PacketData::Error(data) => self.notify_error(data),
            PacketData::Connect(_) => {
                debug!("[sid={}] unexpected CONNECT for an established socket", self.id)
            }
        }
    }

    async fn recv_event(
        self: &Arc<Self>,
        e: String,
        data: Value,
        bin: Vec<Vec<u8>>,
        ack: Option<i64>,
    ) {
        if is_reserved_event(&e) {
            debug!("[sid={}] reserved event {e:?} received over the wire, dropped", self.id);
            return;
        }
        let chain: Vec<EventMiddleware<A>> = self.middlewares.read().unwrap().clone();
        for mw in chain {
            if let Err(err) = mw(self.clone(), e.clone(), data.clone()).await {
                debug!("[sid={}] event middleware rejected {e:?}: {err}", self.id);
                if let Err(e) = self.send_packet(Packet::error(self.ns.path.clone(), err.to_string()))
                {
                    debug!("[sid={}] middleware error not sent: {e:?}", self.id);
                }
                return;
            }
        }
        match self.dispatch(&e, data, bin, ack) {
            // listeners run on a later tick than the decode
            Some(fut) => {
                tokio::spawn(fut);
            }
            None => debug!("[sid={}] no listener for event {e:?}", self.id),
        }
    }

    fn recv_ack(&self, data: Value, bin: Vec<Vec<u8>>, ack: i64) {
        if let Some(tx) = self.ack_message.lock().unwrap().remove(&ack) {
            tx.send((data, bin)).ok();
        } else {
            debug!("[sid={}] unknown ack id: {ack}", self.id);
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        event: &str,
        data: Value,
        bin: Vec<Vec<u8>>,
        ack_id: Option<i64>,
    ) -> Option<BoxFuture<'static, ()>> {
        let handler = self.listeners.read().unwrap().get(event).cloned()?;
        Some(handler.call(self.clone(), data, bin, ack_id))
    }

    /// Raise an event on the local registry only.
    pub(crate) fn dispatch_local(self: &Arc<Self>, event: &str, data: Value) {
        match self.dispatch(event, data, vec![], None) {
            Some(fut) => {
                tokio::spawn(fut);
            }
            // an unlistened error still goes to the log
            None if event == "error" => error!("[sid={}] unhandled socket error", self.id),
            None => debug!("[sid={}] no local listener for {event:?}", self.id),
        }
    }

    pub(crate) fn notify_error(self: &Arc<Self>, data: Value) {
        self.dispatch_local("error", data);
    }

    /// Teardown, idempotent. Order matters: `disconnecting` listeners run
    /// while room membership is still queryable, `disconnect` listeners after
    /// the socket is fully unregistered.
    pub(crate) async fn close(self: &Arc<Self>, reason: DisconnectReason) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[sid={}] closing: {reason}", self.id);
        let reason = Value::String(reason.to_string());
        if let Some(fut) = self.dispatch("disconnecting", reason.clone(), vec![], None) {
            fut.await;
        }
        if self.ns.adapter().del_all(&self.id).await.is_err() {
            debug!("[sid={}] adapter leave-all failed", self.id);
        }
        self.ns.remove(&self.id);
        self.client.remove_socket(&self.id, &self.ns.path);
        self.connected.store(false, Ordering::SeqCst);
        // pending ack waiters resolve with `AckError::SocketClosed`
        self.ack_message.lock().unwrap().clear();
        if let Some(fut) = self.dispatch("disconnect", reason, vec![], None) {
            fut.await;
        }
    }
}

impl<A: Adapter> std::fmt::Debug for Socket<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.id)
            .field("ns", &self.ns.path)
            .field("connected", &self.connected())
            .finish()
    }
}

#[cfg(test)]
impl<A: Adapter> Socket<A> {
    pub(crate) fn new_dummy(ns: Arc<Namespace<A>>, conn_id: &str) -> Arc<Socket<A>> {
        let client = Client::new_dummy(conn_id);
        let handshake = Handshake::new(&*client.conn_for_test(), Default::default());
        let sid = Sid::new(&ns.path, conn_id);
        let socket = Arc::new(Socket::new(client.clone(), ns.clone(), handshake, sid.clone()));
        ns.insert_for_test(&socket);
        client.add_socket(&socket);
        socket
    }
}
