//! Session identity: the access credential and the cached user profile.
//!
//! Every component goes through [`SessionStore`]; nothing else touches the
//! persisted session directly. Stores are read on every access so that a
//! credential refreshed by another process is picked up immediately.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Cached user profile as returned by the login endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_provider: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Profile {
    pub fn is_admin(&self) -> bool {
        self.is_staff
    }
}

/// What a store persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Profile>,
}

/// Single source of truth for session identity.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<SessionData, SessionError>;

    fn store(&self, data: &SessionData) -> Result<(), SessionError>;

    fn clear(&self) -> Result<(), SessionError>;

    fn access_token(&self) -> Result<Option<String>, SessionError> {
        Ok(self.load()?.access)
    }

    fn set_access_token(&self, token: &str) -> Result<(), SessionError> {
        let mut data = self.load()?;
        data.access = Some(token.to_string());
        self.store(&data)
    }

    fn profile(&self) -> Result<Option<Profile>, SessionError> {
        Ok(self.load()?.user)
    }

    fn set_profile(&self, profile: &Profile) -> Result<(), SessionError> {
        let mut data = self.load()?;
        data.user = Some(profile.clone());
        self.store(&data)
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    data: Mutex<SessionData>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access_token(token: impl Into<String>) -> Self {
        Self {
            data: Mutex::new(SessionData {
                access: Some(token.into()),
                user: None,
            }),
        }
    }

    pub fn with_session(data: SessionData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<SessionData, SessionError> {
        Ok(self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn store(&self, data: &SessionData) -> Result<(), SessionError> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = data.clone();
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = SessionData::default();
        Ok(())
    }
}

/// JSON file store, re-read on every access. A missing file is an empty session.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<SessionData, SessionError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(SessionData::default()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionData::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, data: &SessionData) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Write-then-rename so concurrent readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
