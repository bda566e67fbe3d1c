//! Persisted client state: the bearer token and the signed-in user record.
//!
//! Both live under fixed keys in a small key/value store. A session only
//! counts as present when the token and the user record are both there.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const TOKEN_KEY: &str = "mentori_auth";
pub const USER_KEY: &str = "mentori_user";

/// Account role chosen at sign-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Mentor,
    Mentee,
}

impl Role {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mentor" => Some(Self::Mentor),
            "mentee" => Some(Self::Mentee),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mentor => "mentor",
            Self::Mentee => "mentee",
        }
    }

    /// The role this one is matched with
    pub fn counterpart(&self) -> Self {
        match self {
            Self::Mentor => Self::Mentee,
            Self::Mentee => Self::Mentor,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User record returned by the backend on sign-in
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// An established session
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user: AuthUser,
    pub token: String,
}

/// Minimal string key/value persistence
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_all(&[(key, value)])
    }
    /// Store all `pairs` as a single update; nothing changes on failure
    fn set_all(&self, pairs: &[(&str, &str)]) -> Result<()>;
    /// Remove all `keys` as a single update; nothing changes on failure
    fn remove_all(&self, keys: &[&str]) -> Result<()>;
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process store, lost on exit
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set_all(&self, pairs: &[(&str, &str)]) -> Result<()> {
        let mut values = lock(&self.values);
        for (key, value) in pairs {
            values.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[&str]) -> Result<()> {
        let mut values = lock(&self.values);
        for key in keys {
            values.remove(*key);
        }
        Ok(())
    }
}

/// JSON object on disk, rewritten whole on every change
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read state file {}", path.display()))?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Corrupt state file {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(values)?;
        // Write a sibling file first so a crash never leaves half a state file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to write state file {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set_all(&self, pairs: &[(&str, &str)]) -> Result<()> {
        let mut values = lock(&self.values);
        let mut next = values.clone();
        for (key, value) in pairs {
            next.insert(key.to_string(), value.to_string());
        }
        self.persist(&next)?;
        *values = next;
        Ok(())
    }

    fn remove_all(&self, keys: &[&str]) -> Result<()> {
        let mut values = lock(&self.values);
        let mut next = values.clone();
        for key in keys {
            next.remove(*key);
        }
        self.persist(&next)?;
        *values = next;
        Ok(())
    }
}

/// Session persistence on top of a key/value store
pub struct AuthStorage {
    store: Box<dyn KeyValueStore>,
}

impl AuthStorage {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    pub fn token(&self) -> Option<String> {
        self.store.get(TOKEN_KEY)
    }

    /// Stored user record; an unparseable record reads as absent
    pub fn user(&self) -> Option<AuthUser> {
        let raw = self.store.get(USER_KEY)?;
        serde_json::from_str(&raw).ok()
    }

    /// The current session, present only when both token and user are stored
    pub fn session(&self) -> Option<Session> {
        match (self.token(), self.user()) {
            (Some(token), Some(user)) => Some(Session { user, token }),
            _ => None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.session().is_some()
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let user = serde_json::to_string(&session.user)?;
        self.store
            .set_all(&[(USER_KEY, user.as_str()), (TOKEN_KEY, session.token.as_str())])
    }

    /// Forget the session: token and user go together
    pub fn clear(&self) -> Result<()> {
        self.store.remove_all(&[TOKEN_KEY, USER_KEY])
    }
}

#[cfg(test)]
pub fn sample_user(role: Role) -> AuthUser {
    AuthUser {
        id: "7f9c2ba4-e88f-4d3b-8c1a-0a5b1c2d3e4f".to_string(),
        email: "a@b.com".to_string(),
        role,
        created_at: "2024-05-01T12:00:00Z".parse().unwrap(),
    }
}
