//! Peer and session identities: random 16-byte ids, display names, session handles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Display names longer than this (in UTF-8 bytes) are rejected by transports.
pub const MAX_DISPLAY_NAME_LEN: usize = 63;

/// Stable identity of one participant. Equality and hashing use the id bytes only;
/// the display name travels with the id so transports can label peers.
#[derive(Clone, Serialize, Deserialize)]
pub struct PeerId {
    #[serde(with = "bytes_16")]
    id: [u8; 16],
    display_name: Arc<str>,
}

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    /// New random identity for a local participant.
    pub fn new(display_name: &str) -> Result<Self, IdentityError> {
        validate_display_name(display_name)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().into_bytes(),
            display_name: Arc::from(display_name),
        })
    }

    /// Rebuild an identity reported by a transport.
    pub fn from_parts(id: [u8; 16], display_name: &str) -> Self {
        Self {
            id,
            display_name: Arc::from(display_name),
        }
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerId {}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}, {})", self.display_name, short_hex(&self.id[..4]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.display_name, short_hex(&self.id[..2]))
    }
}

fn short_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Check a display name: non-empty, at most [`MAX_DISPLAY_NAME_LEN`] bytes.
pub fn validate_display_name(name: &str) -> Result<(), IdentityError> {
    if name.is_empty() {
        return Err(IdentityError::EmptyDisplayName);
    }
    if name.len() > MAX_DISPLAY_NAME_LEN {
        return Err(IdentityError::DisplayNameTooLong(name.len()));
    }
    Ok(())
}

/// Opaque id of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("display name is empty")]
    EmptyDisplayName,
    #[error("display name is {0} bytes, limit is 63")]
    DisplayNameTooLong(usize),
}
