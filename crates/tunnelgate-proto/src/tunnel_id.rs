//! Tunnel identifiers
//!
//! A tunnel identifier is the first path segment of every public URL, so it is
//! restricted to the RFC 3986 unreserved set and never needs percent-encoding.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest identifier accepted on the relay port
pub const MAX_TUNNEL_ID_LEN: usize = 128;

/// Tunnel identifier validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelIdError {
    #[error("Tunnel ID is empty")]
    Empty,

    #[error("Tunnel ID is longer than {max} characters")]
    TooLong { max: usize },

    #[error("Tunnel ID contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Opaque, URL-path-safe token naming one exposed service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TunnelId(String);

impl TunnelId {
    /// Validate and wrap an identifier
    pub fn parse(raw: &str) -> Result<Self, TunnelIdError> {
        if raw.is_empty() {
            return Err(TunnelIdError::Empty);
        }
        if raw.len() > MAX_TUNNEL_ID_LEN {
            return Err(TunnelIdError::TooLong {
                max: MAX_TUNNEL_ID_LEN,
            });
        }
        if let Some(bad) = raw.chars().find(|c| !is_unreserved(*c)) {
            return Err(TunnelIdError::InvalidCharacter(bad));
        }
        Ok(Self(raw.to_string()))
    }

    /// Parse the registration line sent by an agent (trailing CR/LF stripped)
    pub fn from_registration_line(line: &[u8]) -> Result<Self, TunnelIdError> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = std::str::from_utf8(line)
            .map_err(|_| TunnelIdError::InvalidCharacter(char::REPLACEMENT_CHARACTER))?;
        Self::parse(text.trim())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The line an agent writes to register this identifier
    pub fn registration_line(&self) -> String {
        format!("{}\n", self.0)
    }

    /// Public path prefix for this tunnel (e.g. `/myapp/`)
    pub fn public_path(&self) -> String {
        format!("/{}/", self.0)
    }
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~')
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TunnelId {
    type Err = TunnelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TunnelId {
    type Error = TunnelIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TunnelId> for String {
    fn from(id: TunnelId) -> Self {
        id.0
    }
}

// Lets maps keyed by TunnelId be queried with a plain &str
impl Borrow<str> for TunnelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TunnelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
