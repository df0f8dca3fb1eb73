//! Agent identity
//!
//! An agent is identified by the subject common name of its leaf certificate.
//! The identity is fixed at issuance and checked on every connection.

use std::borrow::Borrow;
use std::fmt;

use thiserror::Error;

/// Maximum length of an X.509 common name (RFC 5280 ub-common-name)
pub const MAX_AGENT_ID_LEN: usize = 64;

/// Errors constructing an [`AgentId`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentIdError {
    /// Identity was empty or only whitespace
    #[error("agent id must not be empty")]
    Empty,

    /// Identity exceeds the common name length bound
    #[error("agent id is {len} bytes, maximum is {MAX_AGENT_ID_LEN}")]
    TooLong {
        /// Actual length in bytes
        len: usize,
    },

    /// Identity contains a control character
    #[error("agent id contains control characters")]
    ControlCharacter,
}

/// Unique agent identifier, bound 1:1 to the leaf certificate CN
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(String);

impl AgentId {
    /// Validate and wrap an identity string
    pub fn new(id: impl Into<String>) -> Result<Self, AgentIdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(AgentIdError::Empty);
        }
        if id.len() > MAX_AGENT_ID_LEN {
            return Err(AgentIdError::TooLong { len: id.len() });
        }
        if id.chars().any(char::is_control) {
            return Err(AgentIdError::ControlCharacter);
        }
        Ok(Self(id))
    }

    /// Borrow as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner string
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for AgentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AgentId {
    type Error = AgentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for AgentId {
    type Error = AgentIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for AgentId {
    type Err = AgentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
