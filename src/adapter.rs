use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use itertools::Itertools;
use tracing::debug;

use crate::errors::BroadcastError;
use crate::ns::Namespace;
use crate::packet::Packet;
use crate::sid::Sid;
use crate::socket::Socket;
use crate::transport::WriteOptions;

pub type Room = String;

/// Modifiers applied to a broadcast.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum BroadcastFlags {
    /// Do not forward the broadcast to peer nodes (distributed adapters).
    Local,
    /// Exclude the originating socket from the targets.
    Broadcast,
    /// Skip targets whose transport is not currently writable instead of
    /// queueing.
    Volatile,
    /// Ask the transport to compress each written frame.
    Compress,
}

/// Target selection for a broadcast: the union of `rooms` (everyone known to
/// the adapter when empty), minus the members of `except`, minus `sid` when
/// the [`Broadcast`](BroadcastFlags::Broadcast) flag is set.
#[derive(Debug, Default)]
pub struct BroadcastOptions {
    pub flags: HashSet<BroadcastFlags>,
    pub rooms: Vec<Room>,
    pub except: Vec<Room>,
    pub sid: Option<Sid>,
}

impl BroadcastOptions {
    pub fn new(sid: Option<Sid>) -> Self {
        Self {
            sid,
            ..Default::default()
        }
    }
}

/// Room-membership bookkeeping and packet fan-out for one namespace.
///
/// The in-memory [`MemoryAdapter`] is the reference semantics; a distributed
/// implementation must preserve them for the local node and additionally
/// forward non-[`Local`](BroadcastFlags::Local) broadcasts to its peers.
///
/// Membership operations are idempotent against unknown sids and rooms, and a
/// broadcast reaching an already-dead socket is a silent no-op.
#[async_trait]
pub trait Adapter: Sized + Send + Sync + 'static {
    /// Errors a distributed implementation can surface; [`Infallible`] for
    /// the in-memory one.
    type Error: std::error::Error + Send + Sync + 'static;

    fn new(ns: Weak<Namespace<Self>>) -> Self;

    /// Add the socket to every room, creating rooms on demand.
    async fn add_all(&self, sid: Sid, rooms: Vec<Room>) -> Result<(), Self::Error>;

    /// Remove the socket from the given rooms; a room is dropped once empty.
    async fn del(&self, sid: &Sid, rooms: Vec<Room>) -> Result<(), Self::Error>;

    /// Remove the socket from every room it belongs to.
    async fn del_all(&self, sid: &Sid) -> Result<(), Self::Error>;

    /// Encode the packet once and write it to every selected socket.
    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), BroadcastError>;

    /// The sids present in the given rooms, or every known sid when `rooms`
    /// is empty. Async because distributed adapters aggregate across nodes.
    async fn sockets(&self, rooms: Vec<Room>) -> Result<HashSet<Sid>, Self::Error>;

    /// The rooms the socket belongs to.
    async fn socket_rooms(&self, sid: &Sid) -> Result<HashSet<Room>, Self::Error>;

    /// The local socket handles selected by `opts`.
    async fn fetch_sockets(&self, opts: BroadcastOptions) -> Result<Vec<Arc<Socket<Self>>>, Self::Error>;

    /// Make every selected socket join the given rooms.
    async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<(), Self::Error>;

    /// Make every selected socket leave the given rooms.
    async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<(), Self::Error>;

    /// Disconnect every selected socket from its namespace.
    async fn disconnect_sockets(&self, opts: BroadcastOptions) -> Result<(), Self::Error>;
}

/// Rooms and their inverse, guarded together so membership stays
/// bidirectional under concurrent joins and leaves.
#[derive(Debug, Default)]
struct MemberMaps {
    rooms: HashMap<Room, HashSet<Sid>>,
    sids: HashMap<Sid, HashSet<Room>>,
}

/// The default, single-node adapter.
#[derive(Debug)]
pub struct MemoryAdapter {
    members: RwLock<MemberMaps>,
    ns: Weak<Namespace<Self>>,
}

#[async_trait]
impl Adapter for MemoryAdapter {
    type Error = Infallible;

    fn new(ns: Weak<Namespace<Self>>) -> Self {
        Self {
            members: RwLock::new(MemberMaps::default()),
            ns,
        }
    }

    async fn add_all(&self, sid: Sid, rooms: Vec<Room>) -> Result<(), Infallible> {
        let mut members = self.members.write().unwrap();
        for room in rooms {
            members
                .rooms
                .entry(room.clone())
                .or_default()
                .insert(sid.clone());
            members.sids.entry(sid.clone()).or_default().insert(room);
        }
        Ok(())
    }

    async fn del(&self, sid: &Sid, rooms: Vec<Room>) -> Result<(), Infallible> {
        let mut members = self.members.write().unwrap();
        for room in rooms {
            if let Some(sids) = members.rooms.get_mut(&room) {
                sids.remove(sid);
                if sids.is_empty() {
                    members.rooms.remove(&room);
                }
            }
            if let Some(joined) = members.sids.get_mut(sid) {
                joined.remove(&room);
                if joined.is_empty() {
                    members.sids.remove(sid);
                }
            }
        }
        Ok(())
    }

    async fn del_all(&self, sid: &Sid) -> Result<(), Infallible> {
        let mut members = self.members.write().unwrap();
        if let Some(joined) = members.sids.remove(sid) {
            for room in joined {
                if let Some(sids) = members.rooms.get_mut(&room) {
                    sids.remove(sid);
                    if sids.is_empty() {
                        members.rooms.remove(&room);
                    }
                }
            }
        }
        Ok(())
    }

    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), BroadcastError> {
        let volatile = opts.flags.contains(&BroadcastFlags::Volatile);
        let write_opts = WriteOptions {
            compress: opts.flags.contains(&BroadcastFlags::Compress),
        };
        let sockets = self.apply_opts(&opts);
        debug!("broadcasting packet to {} sockets", sockets.len());

        // encode once, fan the frames out
        let frames = packet.into_frames()?;
        for socket in sockets {
            if let Err(_e) = socket.send_frames(frames.clone(), write_opts, volatile) {
                debug!("broadcast to {} dropped: {_e:?}", socket.id);
            }
        }
        Ok(())
    }

    async fn sockets(&self, rooms: Vec<Room>) -> Result<HashSet<Sid>, Infallible> {
        let members = self.members.read().unwrap();
        if rooms.is_empty() {
            Ok(members.sids.keys().cloned().collect())
        } else {
            Ok(rooms
                .iter()
                .filter_map(|room| members.rooms.get(room))
                .flatten()
                .cloned()
                .collect())
        }
    }

    async fn socket_rooms(&self, sid: &Sid) -> Result<HashSet<Room>, Infallible> {
        let members = self.members.read().unwrap();
        Ok(members.sids.get(sid).cloned().unwrap_or_default())
    }

    async fn fetch_sockets(&self, opts: BroadcastOptions) -> Result<Vec<Arc<Socket<Self>>>, Infallible> {
        Ok(self.apply_opts(&opts))
    }

    async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<(), Infallible> {
        for socket in self.apply_opts(&opts) {
            self.add_all(socket.id.clone(), rooms.clone()).await?;
        }
        Ok(())
    }

    async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<(), Infallible> {
        for socket in self.apply_opts(&opts) {
            self.del(&socket.id, rooms.clone()).await?;
        }
        Ok(())
    }

    async fn disconnect_sockets(&self, opts: BroadcastOptions) -> Result<(), Infallible> {
        for socket in self.apply_opts(&opts) {
            if let Err(_e) = socket.disconnect().await {
                debug!("disconnect of {} dropped: {_e:?}", socket.id);
            }
        }
        Ok(())
    }
}

impl MemoryAdapter {
    /// Resolve `opts` to the matching connected sockets.
    fn apply_opts(&self, opts: &BroadcastOptions) -> Vec<Arc<Socket<Self>>> {
        let ns = match self.ns.upgrade() {
            Some(ns) => ns,
            None => return vec![],
        };

        let sids = {
            let members = self.members.read().unwrap();
            let mut except = self.except_sids(&members, &opts.except);
            if opts.flags.contains(&BroadcastFlags::Broadcast) {
                if let Some(sid) = &opts.sid {
                    except.insert(sid.clone());
                }
            }

            if opts.rooms.is_empty() {
                members
                    .sids
                    .keys()
                    .filter(|sid| !except.contains(*sid))
                    .cloned()
                    .collect::<Vec<_>>()
            } else {
                opts.rooms
                    .iter()
                    .filter_map(|room| members.rooms.get(room))
                    .flatten()
                    .unique()
                    .filter(|sid| !except.contains(*sid))
                    .cloned()
                    .collect()
            }
        };

        sids.iter().filter_map(|sid| ns.get_socket(sid)).collect()
    }

    fn except_sids(&self, members: &MemberMaps, except: &[Room]) -> HashSet<Sid> {
        let mut except_sids = HashSet::new();
        for room in except {
            if let Some(sids) = members.rooms.get(room) {
                except_sids.extend(sids.iter().cloned());
            }
        }
        except_sids
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ns::Namespace;

    fn adapter() -> Arc<Namespace<MemoryAdapter>> {
        Namespace::new_dummy("/")
    }

    #[tokio::test]
    async fn membership_is_bidirectional() {
        let ns = adapter();
        let sid = Sid::from("s1");
        ns.adapter()
            .add_all(sid.clone(), vec!["r1".into(), "r2".into()])
            .await
            .unwrap();

        let rooms = ns.adapter().socket_rooms(&sid).await.unwrap();
        assert!(rooms.contains("r1") && rooms.contains("r2"));
        assert!(ns.adapter().sockets(vec!["r1".into()]).await.unwrap().contains(&sid));
        assert!(ns.adapter().sockets(vec!["r2".into()]).await.unwrap().contains(&sid));
    }

    #[tokio::test]
    async fn del_drops_empty_rooms() {
        let ns = adapter();
        let sid = Sid::from("s1");
        ns.adapter().add_all(sid.clone(), vec!["r1".into()]).await.unwrap();
        ns.adapter().del(&sid, vec!["r1".into()]).await.unwrap();

        assert!(ns.adapter().sockets(vec!["r1".into()]).await.unwrap().is_empty());
        assert!(ns.adapter().socket_rooms(&sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn del_all_clears_every_room() {
        let ns = adapter();
        let sid = Sid::from("s1");
        let other = Sid::from("s2");
        ns.adapter()
            .add_all(sid.clone(), vec!["r1".into(), "r2".into()])
            .await
            .unwrap();
        ns.adapter().add_all(other.clone(), vec!["r1".into()]).await.unwrap();

        ns.adapter().del_all(&sid).await.unwrap();
        assert!(ns.adapter().socket_rooms(&sid).await.unwrap().is_empty());
        let r1 = ns.adapter().sockets(vec!["r1".into()]).await.unwrap();
        assert_eq!(r1.len(), 1);
        assert!(r1.contains(&other));
    }

    #[tokio::test]
    async fn removals_are_idempotent() {
        let ns = adapter();
        let sid = Sid::from("ghost");
        ns.adapter().del(&sid, vec!["nowhere".into()]).await.unwrap();
        ns.adapter().del_all(&sid).await.unwrap();
        assert!(ns.adapter().sockets(vec![]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sids_are_deduplicated_across_rooms() {
        let ns = adapter();
        let sid = Sid::from("s1");
        ns.adapter()
            .add_all(sid.clone(), vec!["r1".into(), "r2".into()])
            .await
            .unwrap();

        let sids = ns
            .adapter()
            .sockets(vec!["r1".into(), "r2".into()])
            .await
            .unwrap();
        assert_eq!(sids.len(), 1);
    }
}
