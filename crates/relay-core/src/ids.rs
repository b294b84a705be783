//! Session and subscriber identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::RelayError;

/// Client-supplied session key. Opaque and never empty.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Validate a raw `sessionId` query value.
    ///
    /// Absent and empty values are rejected with [`RelayError::InvalidSessionId`].
    /// The value is otherwise taken verbatim; no trimming or normalisation.
    pub fn parse(raw: Option<&str>) -> Result<Self, RelayError> {
        match raw {
            Some(s) if !s.is_empty() => Ok(Self(s.to_owned())),
            _ => Err(RelayError::InvalidSessionId),
        }
    }

    /// The id as given by the client.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for SessionId {
    type Error = RelayError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(Some(value))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stable identity of one subscriber connection, used as the key of a
/// session's subscriber set.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Fresh time-ordered id, `sub_<uuidv7>`.
    pub fn new() -> Self {
        Self(format!("sub_{}", Uuid::now_v7()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
