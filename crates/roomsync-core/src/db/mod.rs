//! Database layer for roomsync

mod connection;
mod migrations;
mod store;

pub use connection::{Database, Location};
pub use store::{LibSqlStore, RoomSummary};
