//! Client manager: user accounts backed by a JSON file
//!
//! Stores account metadata and PBKDF2 verifiers only. A plaintext password
//! exists exactly once, in the value returned from `create_user` or
//! `reset_password`.

use crate::config::{ClientConfig, Config};
use crate::crypto::{generate_password, hash_password, verify_password};
use crate::mode::VpnMode;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// Client manager errors
#[derive(Debug, Error)]
pub enum UserError {
    #[error("User already exists: {0}")]
    AlreadyExists(String),

    #[error("User not found: {0}")]
    NotFound(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("User database I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("User database is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Failed to render client config: {0}")]
    Render(String),
}

/// Persisted account record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// base64 PBKDF2 output
    pub password_hash: String,
    /// base64 PBKDF2 salt
    pub password_salt: String,
    #[serde(default)]
    pub mode: VpnMode,
    /// Unix seconds
    pub created: u64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub last_connected: Option<u64>,
    #[serde(default)]
    pub total_connections: u64,
}

fn default_active() -> bool {
    true
}

/// Account view without secrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub username: String,
    pub mode: VpnMode,
    pub created: u64,
    pub active: bool,
    pub last_connected: Option<u64>,
    pub total_connections: u64,
}

impl From<&UserRecord> for UserInfo {
    fn from(record: &UserRecord) -> Self {
        Self {
            username: record.username.clone(),
            mode: record.mode,
            created: record.created,
            active: record.active,
            last_connected: record.last_connected,
            total_connections: record.total_connections,
        }
    }
}

/// Returned once on creation; the only place the password appears
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub mode: VpnMode,
    pub created: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn validate_username(username: &str) -> Result<(), UserError> {
    let valid = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(UserError::InvalidUsername(username.to_string()))
    }
}

fn verifier(password: &str) -> (String, String) {
    let stored = hash_password(password, None);
    (STANDARD.encode(stored.hash), STANDARD.encode(stored.salt))
}

#[derive(Debug)]
pub struct ClientManager {
    path: Option<PathBuf>,
    users: RwLock<BTreeMap<String, UserRecord>>,
}

impl ClientManager {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, UserError> {
        let path = path.as_ref().to_path_buf();
        let users = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            BTreeMap::new()
        };
        debug!("Loaded {} user records", users.len());

        Ok(Self {
            path: Some(path),
            users: RwLock::new(users),
        })
    }

    /// Unpersisted manager
    pub fn in_memory() -> Self {
        Self {
            path: None,
            users: RwLock::new(BTreeMap::new()),
        }
    }

    fn save(&self, users: &BTreeMap<String, UserRecord>) -> Result<(), UserError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(users)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Create an account. A password is generated when none is given.
    pub fn create_user(
        &self,
        username: &str,
        password: Option<&str>,
        mode: VpnMode,
    ) -> Result<NewUser, UserError> {
        validate_username(username)?;
        let mut users = self.users.write();
        if users.contains_key(username) {
            return Err(UserError::AlreadyExists(username.to_string()));
        }

        let password = password
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_password);
        let (password_hash, password_salt) = verifier(&password);
        let created = unix_now();

        users.insert(
            username.to_string(),
            UserRecord {
                username: username.to_string(),
                password_hash,
                password_salt,
                mode,
                created,
                active: true,
                last_connected: None,
                total_connections: 0,
            },
        );
        self.save(&users)?;
        info!("Created user with mode {}", mode);

        Ok(NewUser {
            username: username.to_string(),
            password,
            mode,
            created,
        })
    }

    /// Replace the password with a fresh random one
    pub fn reset_password(&self, username: &str) -> Result<String, UserError> {
        let mut users = self.users.write();
        let record = users
            .get_mut(username)
            .ok_or_else(|| UserError::NotFound(username.to_string()))?;

        let password = generate_password();
        let (hash, salt) = verifier(&password);
        record.password_hash = hash;
        record.password_salt = salt;
        self.save(&users)?;
        Ok(password)
    }

    pub fn set_mode(&self, username: &str, mode: VpnMode) -> Result<(), UserError> {
        let mut users = self.users.write();
        users
            .get_mut(username)
            .ok_or_else(|| UserError::NotFound(username.to_string()))?
            .mode = mode;
        self.save(&users)
    }

    pub fn set_active(&self, username: &str, active: bool) -> Result<(), UserError> {
        let mut users = self.users.write();
        users
            .get_mut(username)
            .ok_or_else(|| UserError::NotFound(username.to_string()))?
            .active = active;
        self.save(&users)
    }

    pub fn get_user_info(&self, username: &str) -> Option<UserInfo> {
        self.users.read().get(username).map(UserInfo::from)
    }

    /// Returns whether the user existed
    pub fn delete_user(&self, username: &str) -> Result<bool, UserError> {
        let mut users = self.users.write();
        if users.remove(username).is_none() {
            return Ok(false);
        }
        self.save(&users)?;
        Ok(true)
    }

    pub fn list_users(&self) -> Vec<UserInfo> {
        self.users.read().values().map(UserInfo::from).collect()
    }

    /// Assigned mode for an existing user
    pub fn user_mode(&self, username: &str) -> Option<VpnMode> {
        self.users.read().get(username).map(|r| r.mode)
    }

    /// Check a password. Unknown and disabled users never verify.
    pub fn verify_user(&self, username: &str, password: &str) -> bool {
        let users = self.users.read();
        let Some(record) = users.get(username).filter(|r| r.active) else {
            return false;
        };
        match (
            STANDARD.decode(&record.password_hash),
            STANDARD.decode(&record.password_salt),
        ) {
            (Ok(hash), Ok(salt)) => verify_password(password, &hash, &salt),
            _ => false,
        }
    }

    /// Bump the connection counter and timestamp
    pub fn record_connection(&self, username: &str) -> Result<(), UserError> {
        let mut users = self.users.write();
        if let Some(record) = users.get_mut(username) {
            record.total_connections += 1;
            record.last_connected = Some(unix_now());
            self.save(&users)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

/// Render a client TOML config for a freshly created user
pub fn render_client_config(user: &NewUser, server: &str) -> Result<String, UserError> {
    let config = Config {
        server: None,
        client: Some(ClientConfig {
            server: server.to_string(),
            username: Some(user.username.clone()),
            password: Some(user.password.clone()),
            mode: user.mode.name().to_string(),
            ..ClientConfig::default()
        }),
        ..Config::default()
    };
    let body = toml::to_string_pretty(&config).map_err(|e| UserError::Render(e.to_string()))?;
    Ok(format!(
        "# PhazeVPN client configuration for {}\n# Mode: {}\n\n{}",
        user.username,
        user.mode.display_name(),
        body
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_verify() {
        let manager = ClientManager::in_memory();
        let created = manager.create_user("alice", None, VpnMode::SemiGhost).unwrap();

        assert_eq!(created.password.len(), 22);
        assert!(manager.verify_user("alice", &created.password));
        assert!(!manager.verify_user("alice", "wrong"));
        assert!(!manager.verify_user("mallory", &created.password));
        assert_eq!(manager.user_mode("alice"), Some(VpnMode::SemiGhost));
    }

    #[test]
    fn test_duplicate_and_invalid() {
        let manager = ClientManager::in_memory();
        manager.create_user("bob", Some("pw"), VpnMode::Normal).unwrap();
        assert!(matches!(
            manager.create_user("bob", None, VpnMode::Normal),
            Err(UserError::AlreadyExists(_))
        ));
        assert!(matches!(
            manager.create_user("bad name", None, VpnMode::Normal),
            Err(UserError::InvalidUsername(_))
        ));
    }

    #[test]
    fn test_reset_password() {
        let manager = ClientManager::in_memory();
        manager.create_user("carol", Some("old"), VpnMode::Normal).unwrap();
        let new = manager.reset_password("carol").unwrap();

        assert!(!manager.verify_user("carol", "old"));
        assert!(manager.verify_user("carol", &new));
        assert!(matches!(manager.reset_password("nobody"), Err(UserError::NotFound(_))));
    }

    #[test]
    fn test_mode_info_delete() {
        let manager = ClientManager::in_memory();
        manager.create_user("dave", Some("pw"), VpnMode::Normal).unwrap();
        manager.set_mode("dave", VpnMode::FullGhost).unwrap();

        let info = manager.get_user_info("dave").unwrap();
        assert_eq!(info.mode, VpnMode::FullGhost);
        assert_eq!(info.total_connections, 0);

        manager.record_connection("dave").unwrap();
        assert_eq!(manager.get_user_info("dave").unwrap().total_connections, 1);

        assert!(manager.delete_user("dave").unwrap());
        assert!(!manager.delete_user("dave").unwrap());
        assert!(manager.get_user_info("dave").is_none());
    }

    #[test]
    fn test_disabled_user_cannot_verify() {
        let manager = ClientManager::in_memory();
        manager.create_user("erin", Some("pw"), VpnMode::Normal).unwrap();
        manager.set_active("erin", false).unwrap();
        assert!(!manager.verify_user("erin", "pw"));
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let created = {
            let manager = ClientManager::open(&path).unwrap();
            manager.create_user("frank", None, VpnMode::SemiGhost).unwrap()
        };

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains(&created.password));

        let reopened = ClientManager::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.verify_user("frank", &created.password));
        assert_eq!(reopened.list_users()[0].mode, VpnMode::SemiGhost);
    }

    #[test]
    fn test_render_client_config() {
        let user = NewUser {
            username: "gina".into(),
            password: "s3cret".into(),
            mode: VpnMode::FullGhost,
            created: 0,
        };
        let rendered = render_client_config(&user, "vpn.example.com:51820").unwrap();
        assert!(rendered.contains("vpn.example.com:51820"));
        assert!(rendered.contains("full_ghost"));

        let body: Config = toml::from_str(&rendered).unwrap();
        let client = body.client.unwrap();
        assert_eq!(client.username.as_deref(), Some("gina"));
        assert_eq!(client.password.as_deref(), Some("s3cret"));
    }
}
