//! Concurrent session table
//!
//! Sharded map from session id to a per-session lock. Lookups clone the
//! `Arc` and release the shard before the session lock is taken, so no
//! shard lock is ever held across session work.

use super::{Session, SessionError};
use crate::crypto::random_u32;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub type SessionHandle = Arc<Mutex<Session>>;

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<u32, SessionHandle>,
    routes: DashMap<Ipv4Addr, u32>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under a fresh random nonzero id. `build` receives
    /// the id.
    pub fn insert_with<F>(&self, capacity: usize, build: F) -> Result<(u32, SessionHandle), SessionError>
    where
        F: FnOnce(u32) -> Session,
    {
        if self.sessions.len() >= capacity {
            return Err(SessionError::TableFull);
        }
        loop {
            let id = random_u32();
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.sessions.entry(id) {
                let handle = Arc::new(Mutex::new(build(id)));
                slot.insert(handle.clone());
                return Ok((id, handle));
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn remove(&self, id: u32) -> Option<SessionHandle> {
        self.sessions.remove(&id).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of the ids present right now
    pub fn ids(&self) -> Vec<u32> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn add_route(&self, addr: Ipv4Addr, id: u32) {
        self.routes.insert(addr, id);
    }

    pub fn remove_route(&self, addr: Ipv4Addr) {
        self.routes.remove(&addr);
    }

    /// Session owning a VPN address
    pub fn route(&self, addr: Ipv4Addr) -> Option<u32> {
        self.routes.get(&addr).map(|entry| *entry.value())
    }
}
