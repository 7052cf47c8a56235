use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use futures::{Future, FutureExt};
use itertools::Itertools;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::adapter::{Adapter, BroadcastFlags, Room};
use crate::ns::{ConnectListener, ConnectMiddleware, Namespace};
use crate::operators::{Operators, RoomParam};
use crate::server::Server;
use crate::socket::Socket;

/// How a dynamic namespace template decides whether it owns a requested
/// namespace name.
#[derive(Clone)]
pub enum NsMatcher {
    /// Exact name equality.
    Literal(String),
    /// The name matches the regular expression.
    Regex(Regex),
    /// Arbitrary predicate over the name and the connection auth payload.
    Predicate(Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>),
}

impl NsMatcher {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str, &Value) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub(crate) fn matches(&self, name: &str, auth: &Value) -> bool {
        match self {
            NsMatcher::Literal(s) => s == name,
            NsMatcher::Regex(re) => re.is_match(name),
            NsMatcher::Predicate(f) => f(name, auth),
        }
    }
}

impl From<Regex> for NsMatcher {
    fn from(re: Regex) -> Self {
        Self::Regex(re)
    }
}

impl From<&str> for NsMatcher {
    fn from(name: &str) -> Self {
        Self::Literal(name.to_string())
    }
}

impl From<String> for NsMatcher {
    fn from(name: String) -> Self {
        Self::Literal(name)
    }
}

impl fmt::Debug for NsMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NsMatcher::Literal(s) => f.debug_tuple("Literal").field(s).finish(),
            NsMatcher::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            NsMatcher::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

/// A namespace template: registered under a matcher, it spawns a concrete
/// child [`Namespace`] the first time a connection request names a matching
/// namespace. Children copy the template's middleware and connect listeners
/// at creation time and are registered statically, so the matcher is not
/// consulted again for the same name.
pub struct ParentNamespace<A: Adapter> {
    /// Synthetic registry name of the template itself (`/_<n>`).
    pub name: String,
    matcher: NsMatcher,
    server: Weak<Server<A>>,
    children: RwLock<Vec<Arc<Namespace<A>>>>,
    middlewares: RwLock<Vec<ConnectMiddleware<A>>>,
    listeners: RwLock<Vec<ConnectListener<A>>>,
}

impl<A: Adapter> ParentNamespace<A> {
    pub(crate) fn new(name: String, matcher: NsMatcher, server: Weak<Server<A>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            matcher,
            server,
            children: RwLock::new(Vec::new()),
            middlewares: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Connect middleware copied into every child created afterwards.
    pub fn use_middleware<F, Fut>(&self, mw: F)
    where
        F: Fn(Arc<Socket<A>>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send + 'static,
    {
        let mw: ConnectMiddleware<A> = Arc::new(move |s, auth| mw(s, auth).boxed());
        self.middlewares.write().unwrap().push(mw);
    }

    /// Connect listener rebound to every child created afterwards.
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

    pub(crate) fn matches(&self, name: &str, auth: &Value) -> bool {
        self.matcher.matches(name, auth)
    }

    /// Spawn the concrete namespace for an accepted name and register it in
    /// the server's static registry.
    pub(crate) fn create_child(&self, name: &str) -> Arc<Namespace<A>> {
        debug!("creating child namespace {name} from template {}", self.name);
        let ns = Namespace::new(name.to_string(), self.server.clone());
        ns.extend_from_parent(
            self.middlewares.read().unwrap().clone(),
            self.listeners.read().unwrap().clone(),
        );
        if let Some(server) = self.server.upgrade() {
            server.insert_ns(ns.clone());
        }
        self.children.write().unwrap().push(ns.clone());
        ns
    }

    /// The concrete namespaces spawned from this template so far.
    pub fn children(&self) -> Vec<Arc<Namespace<A>>> {
        self.children.read().unwrap().clone()
    }

    // Template-level broadcast: rooms and flags are staged on a builder and
    // handed to each child's adapter explicitly.

    /// Select all sockets in the given rooms, in every child namespace.
    pub fn to(&self, rooms: impl RoomParam) -> ParentOperators<A> {
        ParentOperators::new(self.children()).to(rooms)
    }

    /// Alias for [`ParentNamespace::to`].
    pub fn within(&self, rooms: impl RoomParam) -> ParentOperators<A> {
        ParentOperators::new(self.children()).within(rooms)
    }

    /// Filter out the sockets that are in the given rooms.
    pub fn except(&self, rooms: impl RoomParam) -> ParentOperators<A> {
        ParentOperators::new(self.children()).except(rooms)
    }

    /// Do not forward the broadcast to peer nodes.
    pub fn local(&self) -> ParentOperators<A> {
        ParentOperators::new(self.children()).local()
    }

    /// Broadcast an event to every socket of every child namespace.
    pub async fn emit(
        &self,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<(), serde_json::Error> {
        ParentOperators::new(self.children()).emit(event, data).await
    }
}

impl<A: Adapter> fmt::Debug for ParentNamespace<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentNamespace")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .field("children", &self.children.read().unwrap().len())
            .finish()
    }
}

/// Broadcast builder over every child of a [`ParentNamespace`]; the staged
/// selection is replayed against each child's adapter.
#[derive(Debug)]
pub struct ParentOperators<A: Adapter> {
    children: Vec<Arc<Namespace<A>>>,
    rooms: Vec<Room>,
    except: Vec<Room>,
    flags: Vec<BroadcastFlags>,
}

impl<A: Adapter> ParentOperators<A> {
    fn new(children: Vec<Arc<Namespace<A>>>) -> Self {
        Self {
            children,
            rooms: vec![],
            except: vec![],
            flags: vec![],
        }
    }

    pub fn to(mut self, rooms: impl RoomParam) -> Self {
        self.rooms.extend(rooms.into_room_iter().unique());
        self
    }

    pub fn within(mut self, rooms: impl RoomParam) -> Self {
        self.rooms.extend(rooms.into_room_iter().unique());
        self
    }

    pub fn except(mut self, rooms: impl RoomParam) -> Self {
        self.except.extend(rooms.into_room_iter().unique());
        self
    }

    pub fn local(mut self) -> Self {
        self.flags.push(BroadcastFlags::Local);
        self
    }

    pub fn volatile(mut self) -> Self {
        self.flags.push(BroadcastFlags::Volatile);
        self
    }

    pub async fn emit(
        self,
        event: impl Into<String>,
        data: impl Serialize,
    ) -> Result<(), serde_json::Error> {
        let event = event.into();
        let data = serde_json::to_value(data)?;
        for child in &self.children {
            let mut ops = Operators::new(child.clone(), None)
                .within(self.rooms.clone())
                .except(self.except.clone());
            for flag in &self.flags {
                ops = match flag {
                    BroadcastFlags::Local => ops.local(),
                    BroadcastFlags::Volatile => ops.volatile(),
                    _ => ops,
                };
            }
            ops.emit(event.clone(), data.clone()).await?;
        }
        Ok(())
    }
}
