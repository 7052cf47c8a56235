use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures::Future;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::adapter::{Adapter, MemoryAdapter};
use crate::client::Client;
use crate::ns::Namespace;
use crate::operators::{Operators, RoomParam};
use crate::packet::Packet;
use crate::parent_ns::{NsMatcher, ParentNamespace};
use crate::socket::{DisconnectReason, Socket};
use crate::transport::{Connection, TransportServer};

/// The root of the messaging layer: the namespace registry and the entry
/// point the transport hands new connections to.
///
/// Servers are plain values; several can coexist in one process, each with
/// its own registries. The default namespace `/` exists from the start.
pub struct Server<A: Adapter = MemoryAdapter> {
    me: Weak<Self>,
    nsps: RwLock<HashMap<String, Arc<Namespace<A>>>>,
    parent_nsps: RwLock<Vec<Arc<ParentNamespace<A>>>>,
    transport: RwLock<Option<Arc<dyn TransportServer>>>,
    /// The default CONNECT acknowledgement currently rides the transport
    /// handshake as an initial packet.
    handshake_connect: AtomicBool,
    parent_counter: AtomicUsize,
}

impl Server<MemoryAdapter> {
    /// A server backed by the in-memory adapter.
    pub fn new() -> Arc<Self> {
        Self::new_with_adapter()
    }
}

impl<A: Adapter> Server<A> {
    /// A server backed by a custom adapter (e.g. a distributed one).
    pub fn new_with_adapter() -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let mut nsps = HashMap::new();
            nsps.insert("/".to_string(), Namespace::new("/".to_string(), me.clone()));
            Self {
                me: me.clone(),
                nsps: RwLock::new(nsps),
                parent_nsps: RwLock::new(Vec::new()),
                transport: RwLock::new(None),
                handshake_connect: AtomicBool::new(false),
                parent_counter: AtomicUsize::new(0),
            }
        })
    }

    /// Look up or create the namespace of the given name. Names are
    /// canonicalized to begin with `/`.
    pub fn of(&self, path: impl AsRef<str>) -> Arc<Namespace<A>> {
        let path = canonical(path.as_ref());
        if let Some(ns) = self.nsps.read().unwrap().get(&path) {
            return ns.clone();
        }
        debug!("creating namespace {path}");
        let mut nsps = self.nsps.write().unwrap();
        nsps.entry(path.clone())
            .or_insert_with(|| Namespace::new(path, self.me.clone()))
            .clone()
    }

    /// Register a dynamic namespace template. Connection requests naming a
    /// namespace no static entry covers try the registered matchers in
    /// insertion order; the first accepting template spawns the concrete
    /// namespace.
    pub fn of_dyn(&self, matcher: impl Into<NsMatcher>) -> Arc<ParentNamespace<A>> {
        let idx = self.parent_counter.fetch_add(1, Ordering::SeqCst);
        let parent = ParentNamespace::new(format!("/_{idx}"), matcher.into(), self.me.clone());
        self.parent_nsps.write().unwrap().push(parent.clone());
        parent
    }

    /// Hand a new transport connection to the layer. The returned client is
    /// the handle the transport feeds frames and lifecycle events into. The
    /// default-namespace handshake starts immediately.
    pub fn connection(&self, conn: Arc<dyn Connection>) -> Arc<Client<A>> {
        debug!("[conn={}] new connection", conn.id());
        let client = Client::new(self.me.clone(), conn);
        let handshake = client.clone();
        tokio::spawn(async move { handshake.connect("/", Value::Null).await });
        client
    }

    /// Attach the transport listener.
    ///
    /// While the default namespace has no connect middleware, its CONNECT
    /// acknowledgement is pre-encoded once and piggy-backed on the transport
    /// handshake, saving one round trip. Installing middleware on `/`
    /// cancels this.
    pub fn attach(&self, transport: Arc<dyn TransportServer>) {
        if !self.of("/").has_middleware() {
            match Packet::connect("/".to_string()).into_frames() {
                Ok(frames) => {
                    transport.set_initial_packet(frames);
                    self.handshake_connect.store(true, Ordering::SeqCst);
                }
                Err(e) => debug!("initial packet not encoded: {e}"),
            }
        }
        *self.transport.write().unwrap() = Some(transport);
    }

    /// Tear down every default-namespace socket, then close the transport.
    pub async fn close(&self) {
        debug!("closing server");
        for socket in self.of("/").created_sockets() {
            socket.close(DisconnectReason::ClosingServer).await;
        }
        if let Some(transport) = self.transport.read().unwrap().as_ref() {
            transport.close();
        }
    }

    // Surface delegated to the default namespace.

    /// Append connect middleware on the default namespace.
    pub fn use_middleware<F, Fut>(&self, mw: F)
    where
        F: Fn(Arc<Socket<A>>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send + 'static,
    {
        self.of("/").use_middleware(mw)
    }

    /// Register a connect listener on the default namespace.
    pub fn on_connect<C, F, V>(&self, callback: C)
    where
        C: Fn(Arc<Socket<A>>, V) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
        V: DeserializeOwned + Send + Sync + 'static,
    {
        self.of("/").on_connect(callback)
    }

    /// Select all default-namespace sockets in the given rooms.
    pub fn to(&self, rooms: impl RoomParam) -> Operators<A> {
        self.of("/").to(rooms)
    }

    /// Alias for [`Server::to`].
    pub fn within(&self, rooms: impl RoomParam) -> Operators<A> {
        self.of("/").within(rooms)
    }

    /// Filter out the default-namespace sockets in the given rooms.
    pub fn except(&self, rooms: impl RoomParam) -> Operators<A> {
        self.of("/").except(rooms)
    }

    /// Broadcast an event to every default-namespace socket.
    pub async fn emit(
        &self,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<(), serde_json::Error> {
        self.of("/").emit(event, data).await
    }

    /// Alias for `emit("message", data)`.
    pub async fn send(&self, data: impl Serialize) -> Result<(), serde_json::Error> {
        self.of("/").send(data).await
    }

    /// Alias for [`Server::send`].
    pub async fn write(&self, data: impl Serialize) -> Result<(), serde_json::Error> {
        self.send(data).await
    }

    // Crate plumbing.

    pub(crate) fn has_ns(&self, name: &str) -> bool {
        self.nsps.read().unwrap().contains_key(name)
    }

    /// Try the dynamic templates in registration order; the first match
    /// spawns (and statically registers) the concrete namespace.
    pub(crate) fn check_namespace(&self, name: &str, auth: &Value) -> Option<Arc<Namespace<A>>> {
        let parents: Vec<_> = self.parent_nsps.read().unwrap().clone();
        parents
            .iter()
            .find(|parent| parent.matches(name, auth))
            .map(|parent| parent.create_child(name))
    }

    pub(crate) fn insert_ns(&self, ns: Arc<Namespace<A>>) {
        self.nsps.write().unwrap().insert(ns.path.clone(), ns);
    }

    pub(crate) fn handshake_connect_active(&self) -> bool {
        self.handshake_connect.load(Ordering::SeqCst)
    }

    /// Stop piggy-backing the default CONNECT acknowledgement on the
    /// transport handshake.
    pub(crate) fn clear_initial_packet(&self) {
        if self.handshake_connect.swap(false, Ordering::SeqCst) {
            debug!("clearing the handshake initial packet");
            if let Some(transport) = self.transport.read().unwrap().as_ref() {
                transport.clear_initial_packet();
            }
        }
    }
}

impl<A: Adapter> std::fmt::Debug for Server<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("nsps", &self.nsps.read().unwrap().keys().collect::<Vec<_>>())
            .field("parent_nsps", &self.parent_nsps.read().unwrap().len())
            .finish()
    }
}

fn canonical(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
