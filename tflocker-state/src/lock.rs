//! Lock tokens and the lock body codec

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque capability proving exclusive write access to a state
///
/// Tokens are stored and compared verbatim. An empty token stands for
/// "no token" and never matches a held lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The empty token, used by unlocked writes and deletes
    pub fn none() -> Self {
        Self(String::new())
    }

    /// Derive the token from a LOCK/UNLOCK request body
    ///
    /// Tools send a JSON [`LockInfo`]; its `ID` is the token, which is also
    /// what they pass back as `?ID=` on writes. A body that isn't a lock info
    /// document (or carries no ID) is used verbatim.
    pub fn from_lock_body(body: &[u8]) -> Self {
        match serde_json::from_slice::<LockInfo>(body) {
            Ok(info) if !info.id.is_empty() => Self(info.id),
            _ => Self(String::from_utf8_lossy(body).trim().to_string()),
        }
    }

    /// Token presented by a write through the `ID` query parameter
    pub fn from_query(id: Option<&str>) -> Self {
        Self(id.unwrap_or_default().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check whether this token is the one stored on a row
    ///
    /// Exact equality; an unset or empty stored token is never matched.
    pub fn matches(&self, stored: Option<&str>) -> bool {
        match stored {
            Some(stored) if !stored.is_empty() => stored == self.0,
            _ => false,
        }
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for LockToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Lock description exchanged with infrastructure tools
///
/// Field names follow the HTTP state-backend wire format (`ID`, `Operation`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LockInfo {
    /// Unique identifier for this lock
    #[serde(rename = "ID")]
    pub id: String,
    /// The operation being performed (e.g., "OperationTypeApply")
    pub operation: String,
    /// Extra information provided by the caller
    pub info: String,
    /// Who acquired the lock (user@hostname)
    pub who: String,
    /// Version of the tool holding the lock
    pub version: String,
    /// When the lock was created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Path to the state, when applicable
    pub path: String,
}

impl LockInfo {
    /// Create a new lock for an operation with a random ID
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            created: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Describe the current holder of a lock, for "already locked" replies
    pub fn holder(token: &LockToken) -> Self {
        Self {
            id: token.as_str().to_string(),
            ..Self::default()
        }
    }
}
