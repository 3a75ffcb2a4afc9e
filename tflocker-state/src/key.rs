//! State addresses

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a state name, in characters (`VARCHAR(64)`)
pub const MAX_NAME_LEN: usize = 64;

/// Errors raised while validating a state address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The state id is not a UUID
    #[error("Can't parse state id [{id}]: {reason}")]
    InvalidStateId { id: String, reason: String },

    /// The name exceeds [`MAX_NAME_LEN`] characters
    #[error("Name too long (> 64 characters): {0}")]
    NameTooLong(String),
}

/// Identifies one logical state object: the `(state_id, name)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    state_id: Uuid,
    name: String,
}

impl StateKey {
    /// Create a key from an already parsed state id
    pub fn new(state_id: Uuid, name: impl Into<String>) -> Result<Self, KeyError> {
        let name = name.into();
        if name.chars().count() > MAX_NAME_LEN {
            return Err(KeyError::NameTooLong(name));
        }

        Ok(Self { state_id, name })
    }

    /// Parse the `name` and `state_id` path segments of a request
    pub fn parse(name: &str, state_id: &str) -> Result<Self, KeyError> {
        let state_id = Uuid::parse_str(state_id).map_err(|e| KeyError::InvalidStateId {
            id: state_id.to_string(),
            reason: e.to_string(),
        })?;

        Self::new(state_id, name)
    }

    pub fn state_id(&self) -> Uuid {
        self.state_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.state_id)
    }
}
