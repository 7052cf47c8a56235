use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures::future::BoxFuture;
use futures::{Future, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::adapter::{Adapter, MemoryAdapter, Room};
use crate::client::Client;
use crate::handshake::Handshake;
use crate::operators::{Operators, RoomParam};
use crate::packet::Packet;
use crate::server::Server;
use crate::sid::Sid;
use crate::socket::Socket;
use crate::transport::ReadyState;

/// Middleware run once per connection attempt, before the socket is
/// registered. An error refuses the connection: the peer receives an ERROR
/// packet carrying the message and no `connect` listener fires.
pub(crate) type ConnectMiddleware<A> = Arc<
    dyn Fn(
            Arc<Socket<A>>,
            Value,
        ) -> BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + Sync,
>;

/// Listener invoked with each newly accepted socket and the auth payload of
/// its connection request.
pub(crate) type ConnectListener<A> = Arc<dyn Fn(Arc<Socket<A>>, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Why a connection attempt produced no socket.
pub(crate) enum ConnectFailure {
    /// Connect middleware refused; the message was sent to the peer.
    Rejected(String),
    /// The transport closed while the attempt was in flight.
    Aborted,
}

/// A named communication scope over the shared transport connections.
///
/// Holds the sockets connected to it, the connect middleware chain and the
/// adapter doing room bookkeeping and fan-out for this scope.
pub struct Namespace<A: Adapter = MemoryAdapter> {
    pub path: String,
    adapter: A,
    server: Weak<Server<A>>,
    /// Sockets created for this namespace, approved or not yet.
    sockets: RwLock<HashMap<Sid, Arc<Socket<A>>>>,
    /// Approved sockets, visible to the adapter.
    connected: RwLock<HashMap<Sid, Arc<Socket<A>>>>,
    middlewares: RwLock<Vec<ConnectMiddleware<A>>>,
    listeners: RwLock<Vec<ConnectListener<A>>>,
    ack_counter: AtomicI64,
}

impl<A: Adapter> Namespace<A> {
    pub(crate) fn new(path: String, server: Weak<Server<A>>) -> Arc<Self> {
        Arc::new_cyclic(|ns| Self {
            path,
            adapter: A::new(ns.clone()),
            server,
            sockets: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            ack_counter: AtomicI64::new(0),
        })
    }

    /// Append connect middleware of the form `(socket, auth)`.
    ///
    /// The chain seen by a connection attempt is the one installed when the
    /// attempt starts. Installing middleware on the default namespace also
    /// cancels the handshake piggy-back of its CONNECT acknowledgement, since
    /// the middleware may refuse the connection.
    pub fn use_middleware<F, Fut>(&self, mw: F)
    where
        F: Fn(Arc<Socket<A>>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send + 'static,
    {
        let mw: ConnectMiddleware<A> = Arc::new(move |s, auth| mw(s, auth).boxed());
        self.middlewares.write().unwrap().push(mw);
        if self.path == "/" {
            if let Some(server) = self.server.upgrade() {
                server.clear_initial_packet();
            }
        }
    }

    /// Register a listener invoked with each accepted socket and the auth
    /// payload of its connection request.
    pub fn on_connect<C, F, V>(&self, callback: C)
    where
        C: Fn(Arc<Socket<A>>, V) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
        V: DeserializeOwned + Send + Sync + 'static,
    {
        let listener: ConnectListener<A> = Arc::new(move |s, auth| {
            match serde_json::from_value::<V>(auth) {
                Ok(auth) => callback(s, auth).boxed(),
                Err(e) => {
                    debug!("connect payload deserialization error: {e}");
                    futures::future::ready(()).boxed()
                }
            }
        });
        self.listeners.write().unwrap().push(listener);
    }

    // Namespace operators: always fan out through the adapter.

    /// Select all sockets in the given rooms.
    pub fn to(self: &Arc<Self>, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.clone(), None).within(rooms)
    }

    /// Alias for [`Namespace::to`]; there is no originating socket to exclude
    /// at the namespace level.
    pub fn within(self: &Arc<Self>, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.clone(), None).within(rooms)
    }

    /// Filter out the sockets that are in the given rooms.
    pub fn except(self: &Arc<Self>, rooms: impl RoomParam) -> Operators<A> {
        Operators::new(self.clone(), None).except(rooms)
    }

    /// Do not forward the broadcast to peer nodes.
    pub fn local(self: &Arc<Self>) -> Operators<A> {
        Operators::new(self.clone(), None).local()
    }

    /// Drop instead of queueing for targets whose transport is not writable.
    pub fn volatile(self: &Arc<Self>) -> Operators<A> {
        Operators::new(self.clone(), None).volatile()
    }

    /// Broadcast an event to every socket of the namespace.
    pub async fn emit(
        self: &Arc<Self>,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<(), serde_json::Error> {
        Operators::new(self.clone(), None).emit(event, data).await
    }

    /// Alias for `emit("message", data)`.
    pub async fn send(self: &Arc<Self>, data: impl Serialize) -> Result<(), serde_json::Error> {
        self.emit("message", data).await
    }

    /// Alias for [`Namespace::send`].
    pub async fn write(self: &Arc<Self>, data: impl Serialize) -> Result<(), serde_json::Error> {
        self.send(data).await
    }

    /// The sids of every socket of the namespace, across all nodes.
    pub async fn all_sockets(&self) -> Result<HashSet<Sid>, A::Error> {
        self.adapter.sockets(vec![]).await
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// The approved sockets currently connected to this namespace.
    pub fn sockets(&self) -> Vec<Arc<Socket<A>>> {
        self.connected.read().unwrap().values().cloned().collect()
    }

    pub fn get_socket(&self, sid: &Sid) -> Option<Arc<Socket<A>>> {
        self.connected.read().unwrap().get(sid).cloned()
    }

    pub(crate) fn next_ack_id(&self) -> i64 {
        self.ack_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn has_middleware(&self) -> bool {
        !self.middlewares.read().unwrap().is_empty()
    }

    /// Every socket created for this namespace, approved or not.
    pub(crate) fn created_sockets(&self) -> Vec<Arc<Socket<A>>> {
        self.sockets.read().unwrap().values().cloned().collect()
    }

    /// Copy a parent template's middleware and listeners into this (child)
    /// namespace.
    pub(crate) fn extend_from_parent(
        &self,
        middlewares: Vec<ConnectMiddleware<A>>,
        listeners: Vec<ConnectListener<A>>,
    ) {
        self.middlewares.write().unwrap().extend(middlewares);
        self.listeners.write().unwrap().extend(listeners);
    }

    /// Drop the socket from both membership maps; idempotent.
    pub(crate) fn remove(&self, sid: &Sid) {
        self.sockets.write().unwrap().remove(sid);
        self.connected.write().unwrap().remove(sid);
    }

    /// Run a connection attempt for `client` through this namespace.
    ///
    /// On success the socket is registered here and on the client, it has
    /// joined the room named by its own id, the CONNECT acknowledgement has
    /// been written (unless it already rode the transport handshake) and
    /// every connect listener has run.
    pub(crate) async fn add(
        self: &Arc<Self>,
        client: &Arc<Client<A>>,
        auth: Value,
        query: HashMap<String, String>,
    ) -> Result<Arc<Socket<A>>, ConnectFailure> {
        let sid = Sid::new(&self.path, client.conn_id());
        let handshake = Handshake::new(client.conn(), query);
        let socket = Arc::new(Socket::new(client.clone(), self.clone(), handshake, sid.clone()));
        self.sockets.write().unwrap().insert(sid.clone(), socket.clone());

        // snapshot: middleware installed during the run does not affect
        // in-flight attempts
        let chain: Vec<ConnectMiddleware<A>> = self.middlewares.read().unwrap().clone();
        for mw in chain {
            if let Err(err) = mw(socket.clone(), auth.clone()).await {
                let msg = err.to_string();
                debug!("[sid={sid}] connection to {} refused: {msg}", self.path);
                self.remove(&sid);
                if let Err(e) = socket.send_packet(Packet::error(self.path.clone(), msg.clone())) {
                    debug!("[sid={sid}] refusal not sent: {e:?}");
                }
                return Err(ConnectFailure::Rejected(msg));
            }
        }

        tokio::task::yield_now().await;
        if client.conn().ready_state() != ReadyState::Open {
            debug!("[sid={sid}] transport closed during connection, abandoning");
            self.remove(&sid);
            return Err(ConnectFailure::Aborted);
        }

        self.connected.write().unwrap().insert(sid.clone(), socket.clone());
        if self
            .adapter
            .add_all(sid.clone(), vec![Room::from(sid.as_str())])
            .await
            .is_err()
        {
            debug!("[sid={sid}] adapter auto-join failed");
        }

        let piggybacked = self.path == "/"
            && self
                .server
                .upgrade()
                .is_some_and(|server| server.handshake_connect_active());
        if !piggybacked {
            if let Err(e) = socket.send_packet(Packet::connect(self.path.clone())) {
                debug!("[sid={sid}] connect ack not sent: {e:?}");
            }
        }

        client.add_socket(&socket);

        let listeners: Vec<ConnectListener<A>> = self.listeners.read().unwrap().clone();
        for listener in listeners {
            listener(socket.clone(), auth.clone()).await;
        }
        Ok(socket)
    }
}

impl<A: Adapter> std::fmt::Debug for Namespace<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("path", &self.path)
            .field("sockets", &self.sockets.read().unwrap().len())
            .field("connected", &self.connected.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
impl<A: Adapter> Namespace<A> {
    pub(crate) fn new_dummy(path: &str) -> Arc<Self> {
        Self::new(path.to_string(), Weak::new())
    }

    pub(crate) fn insert_for_test(&self, socket: &Arc<Socket<A>>) {
        self.sockets
            .write()
            .unwrap()
            .insert(socket.id.clone(), socket.clone());
        self.connected
            .write()
            .unwrap()
            .insert(socket.id.clone(), socket.clone());
    }
}
