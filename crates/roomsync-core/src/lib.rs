//! roomsync-core - Core library for roomsync
//!
//! Keeps a local mirror of multiplayer rooms, playlists and scores fresh
//! without hammering the upstream API: staleness checks, a durable per-room
//! lock, usage accounting against plan quotas, and a bounded ingestion
//! pipeline that commits each room snapshot atomically.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod ingest;
pub mod lock;
pub mod maintenance;
pub mod models;
pub mod service;
pub mod staleness;
pub mod store;
pub mod upstream;
pub mod usage;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use coordinator::{
    JobOutcome, Priority, QueueOutcome, RejectReason, SyncDecision, SyncReason, SyncRequest,
    SyncStatus,
};
pub use error::{Error, Result};
pub use maintenance::Maintenance;
pub use models::{JobId, ResourceKey, ResourceKind};
pub use service::SyncService;
