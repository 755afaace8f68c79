//! Multiplayer room payload as served by the upstream API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A multiplayer room with its playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Upstream's own open/closed flag, when it sends one.
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub host: Option<Participant>,
    #[serde(default)]
    pub playlist: Vec<PlaylistItem>,
}

impl Room {
    /// Whether the room still accepts scores at `now`.
    ///
    /// An explicit upstream flag wins; otherwise a room is active until its end time.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active.unwrap_or_else(|| self.ends_at.is_none_or(|ends_at| ends_at > now))
    }
}

/// One beatmap slot in a room's playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: i64,
    #[serde(default)]
    pub room_id: i64,
    pub beatmap_id: i64,
    #[serde(default)]
    pub ruleset_id: i64,
    #[serde(default)]
    pub owner_id: Option<i64>,
    #[serde(default)]
    pub expired: bool,
}

/// A user that appears in a room, as host or as score submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A score submitted against one playlist item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub playlist_item_id: i64,
    pub total_score: i64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub max_combo: i64,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user: Option<Participant>,
}

/// Everything one ingestion run commits in a single write.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub room: Room,
    pub scores: Vec<Score>,
    /// Deduplicated by user id.
    pub participants: Vec<Participant>,
    /// Freshness timestamp written with the snapshot (Unix ms).
    pub fetched_at: i64,
    pub is_active: bool,
}

/// Derived leader of a room: highest sum of per-item best scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomWinner {
    pub room_id: i64,
    pub user_id: i64,
    pub total_score: i64,
    pub computed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn room(active: Option<bool>, ends_at: Option<DateTime<Utc>>) -> Room {
        Room {
            id: 1,
            name: "Daily challenge".to_string(),
            category: Some("daily_challenge".to_string()),
            active,
            starts_at: None,
            ends_at,
            host: None,
            playlist: Vec::new(),
        }
    }

    #[test]
    fn room_without_end_is_active() {
        assert!(room(None, None).is_active_at(Utc::now()));
    }

    #[test]
    fn room_past_end_is_inactive() {
        let now = Utc::now();
        assert!(!room(None, Some(now - Duration::hours(1))).is_active_at(now));
        assert!(room(None, Some(now + Duration::hours(1))).is_active_at(now));
    }

    #[test]
    fn explicit_flag_wins_over_end_time() {
        let now = Utc::now();
        assert!(!room(Some(false), Some(now + Duration::hours(1))).is_active_at(now));
    }

    #[test]
    fn score_parses_upstream_shape() {
        let payload = r#"{
            "id": 9,
            "user_id": 3,
            "playlist_item_id": 12,
            "total_score": 812345,
            "accuracy": 0.9731,
            "max_combo": 512,
            "passed": true,
            "rank": "S",
            "ended_at": "2026-10-01T12:00:00Z",
            "user": {"id": 3, "username": "peppy", "country_code": "AU"}
        }"#;
        let score: Score = serde_json::from_str(payload).unwrap();
        assert_eq!(score.user.unwrap().username, "peppy");
        assert_eq!(score.total_score, 812_345);
    }
}
