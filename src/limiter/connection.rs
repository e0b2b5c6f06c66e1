//! Per-user connection cap

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

pub const DEFAULT_MAX_CONNECTIONS_PER_USER: usize = 5;

/// Tracks which sessions each user holds. Admission is rare compared to
/// data traffic, so a single lock covers the whole map.
#[derive(Debug)]
pub struct ConnectionLimiter {
    max_per_user: usize,
    users: Mutex<HashMap<String, HashSet<u32>>>,
}

impl Default for ConnectionLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS_PER_USER)
    }
}

impl ConnectionLimiter {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            max_per_user,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_per_user(&self) -> usize {
        self.max_per_user
    }

    /// Admit `session_id` for `username` if under the cap
    pub fn try_connect(&self, username: &str, session_id: u32) -> bool {
        self.try_connect_with(username, session_id, |_| true)
    }

    /// Like `try_connect`, first pruning tracked sessions for which
    /// `is_active` returns false
    pub fn try_connect_with<F>(&self, username: &str, session_id: u32, is_active: F) -> bool
    where
        F: Fn(u32) -> bool,
    {
        let mut users = self.users.lock();
        let sessions = users.entry(username.to_string()).or_default();
        sessions.retain(|sid| is_active(*sid));

        if sessions.contains(&session_id) {
            return true;
        }
        if sessions.len() >= self.max_per_user {
            return false;
        }
        sessions.insert(session_id);
        true
    }

    /// Forget a session
    pub fn disconnect(&self, username: &str, session_id: u32) {
        let mut users = self.users.lock();
        if let Some(sessions) = users.get_mut(username) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                users.remove(username);
            }
        }
    }

    pub fn active_connections(&self, username: &str) -> usize {
        self.users.lock().get(username).map_or(0, HashSet::len)
    }
}
