//! Resource identity and the records keyed by it

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Kind of upstream resource being mirrored.
///
/// Both kinds are multiplayer rooms upstream; a challenge is a curated room
/// that stays listed after it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Challenge,
    Room,
}

impl ResourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Challenge => "challenge",
            Self::Room => "room",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "challenge" => Ok(Self::Challenge),
            "room" => Ok(Self::Room),
            other => Err(Error::InvalidInput(format!("unknown resource kind: {other}"))),
        }
    }
}

/// Stable identity of a synchronised resource: `(kind, upstream id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: i64,
}

impl ResourceKey {
    pub const fn new(kind: ResourceKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub const fn challenge(id: i64) -> Self {
        Self::new(ResourceKind::Challenge, id)
    }

    /// Identity of the durable lock guarding refreshes of this resource.
    pub fn lock_id(&self) -> String {
        format!("sync:{}:{}", self.kind, self.id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    /// Parses `kind:id`; a bare id is taken as a challenge.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = match s.split_once(':') {
            Some((kind, id)) => (kind.parse()?, id),
            None => (ResourceKind::Challenge, s),
        };
        let id = id
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::InvalidInput(format!("invalid resource id: {id}")))?;
        if id <= 0 {
            return Err(Error::InvalidInput(format!(
                "resource id must be positive: {id}"
            )));
        }
        Ok(Self { kind, id })
    }
}

/// Durable freshness record for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    pub key: ResourceKey,
    /// Last successful commit (Unix ms). Never decreases.
    pub last_updated: i64,
    /// Inactive resources are closed upstream and never go stale.
    pub is_active: bool,
}

/// Durable mutual-exclusion record for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_id: String,
    pub holder_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub resource_kind: ResourceKind,
    pub resource_id: i64,
}

impl LockRecord {
    pub fn new(key: ResourceKey, holder_id: impl Into<String>, now_ms: i64, ttl_ms: i64) -> Self {
        Self {
            lock_id: key.lock_id(),
            holder_id: holder_id.into(),
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
            resource_kind: key.kind,
            resource_id: key.id,
        }
    }

    /// A lock is honoured up to and including `expires_at`.
    pub const fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at
    }

    pub const fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_kind, self.resource_id)
    }
}

/// Identifier of an in-flight sync job, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_key_round_trips_through_display() {
        let key = ResourceKey::challenge(1234);
        assert_eq!(key.to_string(), "challenge:1234");
        assert_eq!("challenge:1234".parse::<ResourceKey>().unwrap(), key);
        assert_eq!(key.lock_id(), "sync:challenge:1234");
    }

    #[test]
    fn bare_id_defaults_to_challenge() {
        let key: ResourceKey = " 77 ".parse().unwrap();
        assert_eq!(key, ResourceKey::challenge(77));
    }

    #[test]
    fn resource_key_rejects_garbage() {
        assert!("challenge:abc".parse::<ResourceKey>().is_err());
        assert!("lobby:1".parse::<ResourceKey>().is_err());
        assert!("room:0".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn lock_record_expires_after_deadline() {
        let record = LockRecord::new(ResourceKey::challenge(1), "holder", 1_000, 500);
        assert_eq!(record.expires_at, 1_500);
        assert!(!record.is_expired(1_500));
        assert!(record.is_expired(1_501));
        assert_eq!(record.key(), ResourceKey::challenge(1));
    }
}
