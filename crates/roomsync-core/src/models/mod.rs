//! Data models for roomsync

mod resource;
mod room;

pub use resource::{FreshnessRecord, JobId, LockRecord, ResourceKey, ResourceKind};
pub use room::{Participant, PlaylistItem, Room, RoomSnapshot, RoomWinner, Score};
