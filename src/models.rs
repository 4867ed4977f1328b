use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;

use crate::schema::settings;

#[derive(Queryable, Clone, Debug, PartialEq, Eq)]
pub struct MessageStat {
    pub actor_id: i64,
    pub count: i64,
}

#[derive(Queryable, Clone, Debug, PartialEq, Eq)]
pub struct VoiceStat {
    pub actor_id: i64,
    pub total_time: i64,
    pub session_start: Option<NaiveDateTime>,
}

impl VoiceStat {
    pub fn in_voice(&self) -> bool {
        self.session_start.is_some()
    }
}

#[derive(Queryable, Insertable, Clone, Debug, PartialEq, Eq)]
#[diesel(table_name = settings)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaderboardKind {
    Messages,
    Voice,
}

impl LeaderboardKind {
    pub const ALL: [LeaderboardKind; 2] = [LeaderboardKind::Messages, LeaderboardKind::Voice];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeaderboardKind::Messages => "messages",
            LeaderboardKind::Voice => "voice",
        }
    }
}

impl fmt::Display for LeaderboardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown leaderboard `{}`", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for LeaderboardKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "messages" | "message" | "msg" | "chat" => Ok(LeaderboardKind::Messages),
            "voice" | "vc" => Ok(LeaderboardKind::Voice),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// One ranked row. `metric_value` is a message count or voice seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub actor_id: u64,
    pub metric_value: u64,
}

/// Ranks rows that are already ordered by metric descending, actor ascending.
pub fn rank_rows(rows: Vec<(i64, i64)>) -> Vec<LeaderboardEntry> {
    rows.into_iter()
        .enumerate()
        .map(|(i, (actor_id, metric))| LeaderboardEntry {
            rank: i + 1,
            actor_id: actor_id as u64,
            metric_value: metric.max(0) as u64,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaderboard {
    pub kind: LeaderboardKind,
    pub entries: Vec<LeaderboardEntry>,
    /// Served from an expired cache entry because the store was unreachable.
    pub stale: bool,
}

impl Leaderboard {
    pub fn empty(kind: LeaderboardKind) -> Self {
        Leaderboard {
            kind,
            entries: Vec::new(),
            stale: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorStats {
    pub actor_id: u64,
    pub messages: u64,
    pub voice_time: Duration,
    /// Elapsed time of the open voice session, not yet credited.
    pub current_session: Option<Duration>,
    pub message_rank: Option<usize>,
    pub voice_rank: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEventKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Voice(VoiceEventKind),
}

/// Normalized event handed over by the gateway adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityEvent {
    pub actor_id: u64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn message(actor_id: u64, timestamp: DateTime<Utc>) -> Self {
        ActivityEvent {
            actor_id,
            kind: EventKind::Message,
            timestamp,
        }
    }

    pub fn voice(actor_id: u64, kind: VoiceEventKind, timestamp: DateTime<Utc>) -> Self {
        ActivityEvent {
            actor_id,
            kind: EventKind::Voice(kind),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kind_aliases() {
        assert_eq!("msg".parse::<LeaderboardKind>(), Ok(LeaderboardKind::Messages));
        assert_eq!("VC".parse::<LeaderboardKind>(), Ok(LeaderboardKind::Voice));
        assert!("karma".parse::<LeaderboardKind>().is_err());
    }

    #[test]
    fn ranks_start_at_one() {
        let ranked = rank_rows(vec![(7, 10), (3, 4)]);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].actor_id, 7);
        assert_eq!(ranked[1].rank, 2);
        assert_eq!(ranked[1].metric_value, 4);
    }
}
