//! Connection store (`spec.md` 4.5): a concurrent map from peer address, with a
//! secondary index from session-id, as called for in `spec.md` 9 ("a sharded map...
//! `find(session_id)` requires a secondary index maintained atomically with `put`").

use crate::connection::Connection;
use crate::session::SessionId;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedConnection = Arc<Mutex<Connection>>;

pub trait ConnectionStore: Send + Sync {
    fn put(&self, conn: SharedConnection);
    fn get(&self, peer_addr: SocketAddr) -> Option<SharedConnection>;
    fn find(&self, session_id: &SessionId) -> Option<SharedConnection>;
    fn remove(&self, peer_addr: SocketAddr) -> Option<SharedConnection>;
    fn clear(&self);
    fn peer_addrs(&self) -> Vec<SocketAddr>;
}

/// Default in-memory implementation, per `spec.md` 4.5.
#[derive(Default)]
pub struct InMemoryConnectionStore {
    by_addr: DashMap<SocketAddr, SharedConnection>,
    addr_by_session: DashMap<SessionId, SocketAddr>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        InMemoryConnectionStore::default()
    }
}

impl ConnectionStore for InMemoryConnectionStore {
    fn put(&self, conn: SharedConnection) {
        // Synchronous best-effort read of the session-id for indexing; callers insert
        // before a session-id is known (pre-cookie) and update the index again once
        // one is assigned, so a failed try_lock here just means the index catches up
        // on the next put.
        let peer_addr = {
            if let Ok(guard) = conn.try_lock() {
                let peer_addr = guard.peer_addr;
                if let Some(session) = &guard.established_session {
                    if !session.session_id.is_empty() {
                        self.addr_by_session
                            .insert(session.session_id.clone(), peer_addr);
                    }
                }
                peer_addr
            } else {
                return;
            }
        };
        self.by_addr.insert(peer_addr, conn);
    }

    fn get(&self, peer_addr: SocketAddr) -> Option<SharedConnection> {
        self.by_addr.get(&peer_addr).map(|e| e.value().clone())
    }

    fn find(&self, session_id: &SessionId) -> Option<SharedConnection> {
        let addr = self.addr_by_session.get(session_id)?;
        self.by_addr.get(&*addr).map(|e| e.value().clone())
    }

    fn remove(&self, peer_addr: SocketAddr) -> Option<SharedConnection> {
        self.addr_by_session.retain(|_, v| *v != peer_addr);
        self.by_addr.remove(&peer_addr).map(|(_, v)| v)
    }

    fn clear(&self) {
        self.by_addr.clear();
        self.addr_by_session.clear();
    }

    fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.by_addr.iter().map(|e| *e.key()).collect()
    }
}
