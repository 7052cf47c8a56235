use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::adapter::{Adapter, MemoryAdapter};
use crate::errors::SendError;
use crate::handshake::parse_query;
use crate::ns::ConnectFailure;
use crate::packet::{Packet, PacketData};
use crate::server::Server;
use crate::sid::Sid;
use crate::socket::{DisconnectReason, Socket};
use crate::transport::{Connection, Frame, ReadyState, WriteOptions};

/// The per-connection multiplexer.
///
/// One client owns one transport [`Connection`] and demultiplexes decoded
/// packets among the sockets it holds, one per namespace at most. The
/// transport layer drives it through [`Client::on_data`],
/// [`Client::on_error`] and [`Client::on_close`]; each client processes its
/// inbound traffic in arrival order.
pub struct Client<A: Adapter = MemoryAdapter> {
    server: Weak<Server<A>>,
    conn: Arc<dyn Connection>,
    sockets: RwLock<HashMap<Sid, Arc<Socket<A>>>>,
    nsps: RwLock<HashMap<String, Arc<Socket<A>>>>,
    /// Namespace connection requests received before the default namespace
    /// socket was established, replayed in order once it is.
    connect_buffer: Mutex<Vec<(String, HashMap<String, String>, Value)>>,
    /// Binary packet waiting for the rest of its attachment frames.
    partial_bin_packet: Mutex<Option<Packet>>,
    closed: AtomicBool,
}

impl<A: Adapter> Client<A> {
    pub(crate) fn new(server: Weak<Server<A>>, conn: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            server,
            conn,
            sockets: RwLock::new(HashMap::new()),
            nsps: RwLock::new(HashMap::new()),
            connect_buffer: Mutex::new(Vec::new()),
            partial_bin_packet: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Id of the owned transport connection.
    pub fn conn_id(&self) -> &str {
        self.conn.id()
    }

    pub(crate) fn conn(&self) -> &dyn Connection {
        &*self.conn
    }

    /// The socket established on the given namespace, if any.
    pub fn socket(&self, nsp: &str) -> Option<Arc<Socket<A>>> {
        self.nsps.read().unwrap().get(nsp).cloned()
    }

    /// Every socket currently established on this connection.
    pub fn sockets(&self) -> Vec<Arc<Socket<A>>> {
        self.sockets.read().unwrap().values().cloned().collect()
    }

    /// The namespaces this connection currently has a socket on.
    pub fn namespaces(&self) -> Vec<String> {
        self.nsps.read().unwrap().keys().cloned().collect()
    }

    /// Feed one inbound frame from the transport.
    pub async fn on_data(self: &Arc<Self>, frame: Frame) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match frame {
            Frame::Text(msg) => match Packet::try_from(msg) {
                Ok(packet) => self.on_packet(packet).await,
                Err(e) => self.fail(e, DisconnectReason::PacketParsingError).await,
            },
            Frame::Binary(data) => {
                if self.apply_payload(data) {
                    if let Some(packet) = self.partial_bin_packet.lock().unwrap().take() {
                        self.on_packet(packet).await;
                    }
                }
            }
        }
    }

    /// Transport-level error: forwarded to every socket's error listeners,
    /// then the connection is closed and torn down.
    pub async fn on_error(self: &Arc<Self>, err: impl fmt::Display) {
        self.fail(err, DisconnectReason::TransportError).await;
    }

    /// Transport closure: the single authoritative cleanup trigger.
    /// Idempotent; subsequent transport events are ignored.
    pub async fn on_close(self: &Arc<Self>, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[conn={}] closing client: {reason}", self.conn_id());
        let sockets: Vec<_> = self
            .sockets
            .write()
            .unwrap()
            .drain()
            .map(|(_, socket)| socket)
            .collect();
        for socket in sockets {
            socket.close(reason).await;
        }
        self.nsps.write().unwrap().clear();
        *self.partial_bin_packet.lock().unwrap() = None;
    }

    /// Tear the whole connection down server side. Peer-visible DISCONNECT
    /// packets are not needed: the transport closure tells the peer.
    pub async fn disconnect(self: &Arc<Self>) {
        let sockets: Vec<_> = self
            .sockets
            .write()
            .unwrap()
            .drain()
            .map(|(_, socket)| socket)
            .collect();
        for socket in sockets {
            socket.close(DisconnectReason::ForcedClose).await;
        }
        self.nsps.write().unwrap().clear();
        self.closed.store(true, Ordering::SeqCst);
        self.conn.close();
    }

    async fn on_packet(self: &Arc<Self>, packet: Packet) {
        let incomplete = matches!(
            &packet.inner,
            PacketData::BinaryEvent(_, bin, _) | PacketData::BinaryAck(bin, _)
                if !bin.is_complete()
        );
        if incomplete {
            // cache until the trailing attachment frames arrive
            self.partial_bin_packet.lock().unwrap().replace(packet);
            return;
        }
        match packet.inner {
            PacketData::Connect(auth) => {
                self.connect(&packet.ns, auth.unwrap_or(Value::Null)).await;
            }
            inner => {
                let socket = self.nsps.read().unwrap().get(&packet.ns).cloned();
                match socket {
                    Some(socket) => socket.recv(inner).await,
                    None => debug!(
                        "[conn={}] packet for unknown namespace {} dropped",
                        self.conn_id(),
                        packet.ns
                    ),
                }
            }
        }
    }

    /// Handle a namespace connection request. The `nsp` field carries the
    /// namespace name and, optionally, its query string.
    pub(crate) async fn connect(self: &Arc<Self>, nsp: &str, auth: Value) {
        let (name, query) = split_nsp(nsp);
        let server = match self.server.upgrade() {
            Some(server) => server,
            None => return,
        };
        if server.has_ns(&name) || server.check_namespace(&name, &auth).is_some() {
            self.do_connect(name, query, auth).await;
        } else {
            debug!("[conn={}] invalid namespace {name}", self.conn_id());
            if let Err(e) =
                self.write_packet(Packet::invalid_namespace(name), WriteOptions::default(), false)
            {
                debug!("[conn={}] error packet not sent: {e:?}", self.conn_id());
            }
        }
    }

    /// Connect to a namespace known to exist.
    ///
    /// Non-default requests arriving before the default namespace socket is
    /// established are buffered; they replay in order once the root handshake
    /// completes, or each earn an "Invalid namespace" error if it is refused.
    fn do_connect(
        self: &Arc<Self>,
        name: String,
        query: HashMap<String, String>,
        auth: Value,
    ) -> BoxFuture<'static, ()> {
        let client = self.clone();
        async move {
            if client.socket(&name).is_some() {
                debug!(
                    "[conn={}] already connected to {name}, duplicate request ignored",
                    client.conn_id()
                );
                return;
            }
            if name != "/" && client.socket("/").is_none() {
                debug!(
                    "[conn={}] buffering connect to {name} until the root handshake completes",
                    client.conn_id()
                );
                client.connect_buffer.lock().unwrap().push((name, query, auth));
                return;
            }
            let server = match client.server.upgrade() {
                Some(server) => server,
                None => return,
            };
            let ns = server.of(&name);
            match ns.add(&client, auth, query).await {
                Ok(_) if name == "/" => {
                    let buffered: Vec<_> =
                        client.connect_buffer.lock().unwrap().drain(..).collect();
                    for (name, query, auth) in buffered {
                        client.do_connect(name, query, auth).await;
                    }
                }
                Err(ConnectFailure::Rejected(_)) if name == "/" => {
                    // the buffered namespaces will never be reachable on this
                    // connection; refuse each of them explicitly
                    let buffered: Vec<_> =
                        client.connect_buffer.lock().unwrap().drain(..).collect();
                    for (name, _, _) in buffered {
                        if let Err(e) = client.write_packet(
                            Packet::invalid_namespace(name),
                            WriteOptions::default(),
                            false,
                        ) {
                            debug!("[conn={}] error packet not sent: {e:?}", client.conn_id());
                        }
                    }
                }
                _ => (),
            }
        }
        .boxed()
    }

    /// Register an approved socket under its sid and its namespace name.
    pub(crate) fn add_socket(&self, socket: &Arc<Socket<A>>) {
        self.sockets
            .write()
            .unwrap()
            .insert(socket.id.clone(), socket.clone());
        self.nsps
            .write()
            .unwrap()
            .insert(socket.ns().to_string(), socket.clone());
    }

    /// Unregister a socket from both maps; idempotent.
    pub(crate) fn remove_socket(&self, sid: &Sid, nsp: &str) {
        self.sockets.write().unwrap().remove(sid);
        self.nsps.write().unwrap().remove(nsp);
    }

    /// Encode and write a packet on the connection.
    pub(crate) fn write_packet(
        &self,
        packet: Packet,
        opts: WriteOptions,
        volatile: bool,
    ) -> Result<(), SendError> {
        let frames = packet.into_frames()?;
        self.write_raw(frames, opts, volatile);
        Ok(())
    }

    /// Write pre-encoded frames. Dropped silently when the connection is not
    /// open, or not writable and the write is volatile.
    pub(crate) fn write_raw(&self, frames: Vec<Frame>, opts: WriteOptions, volatile: bool) {
        if self.conn.ready_state() != ReadyState::Open {
            debug!("[conn={}] write on a non-open connection dropped", self.conn_id());
            return;
        }
        if volatile && !self.conn.writable() {
            debug!("[conn={}] volatile write dropped", self.conn_id());
            return;
        }
        for frame in frames {
            self.conn.write(frame, opts);
        }
    }

    /// Apply an incoming binary payload to the partial binary packet waiting
    /// to be filled. Returns true once the packet is complete.
    fn apply_payload(&self, data: Vec<u8>) -> bool {
        if let Some(ref mut packet) = *self.partial_bin_packet.lock().unwrap() {
            match packet.inner {
                PacketData::BinaryEvent(_, ref mut bin, _)
                | PacketData::BinaryAck(ref mut bin, _) => {
                    bin.add_payload(data);
                    bin.is_complete()
                }
                _ => unreachable!("partial packets are always binary"),
            }
        } else {
            debug!("[conn={}] unexpected binary frame dropped", self.conn_id());
            false
        }
    }

    async fn fail(self: &Arc<Self>, err: impl fmt::Display, reason: DisconnectReason) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let msg = err.to_string();
        debug!("[conn={}] connection error: {msg}", self.conn_id());
        let sockets: Vec<_> = self.sockets.read().unwrap().values().cloned().collect();
        for socket in sockets {
            socket.notify_error(Value::String(msg.clone()));
        }
        self.conn.close();
        self.on_close(reason).await;
    }
}

impl<A: Adapter> fmt::Debug for Client<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.conn_id())
            .field("nsps", &self.namespaces())
            .finish()
    }
}

/// Split a namespace request into its name and query parts
/// (`/chat?token=abc` → `/chat` + `{token: abc}`).
fn split_nsp(nsp: &str) -> (String, HashMap<String, String>) {
    match nsp.split_once('?') {
        Some((name, query)) => (name.to_string(), parse_query(query)),
        None => (nsp.to_string(), HashMap::new()),
    }
}

#[cfg(test)]
impl<A: Adapter> Client<A> {
    pub(crate) fn new_dummy(conn_id: &str) -> Arc<Self> {
        Self::new(Weak::new(), crate::transport::dummy::DummyConnection::new(conn_id))
    }

    pub(crate) fn conn_for_test(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nsp_query_split() {
        let (name, query) = split_nsp("/chat?token=abc&x=1");
        assert_eq!(name, "/chat");
        assert_eq!(query["token"], "abc");
        assert_eq!(query["x"], "1");

        let (name, query) = split_nsp("/chat");
        assert_eq!(name, "/chat");
        assert!(query.is_empty());
    }
}
