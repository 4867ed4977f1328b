use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;

use super::{batch::SessionChange, Database};
use crate::{
    error::StoreError,
    models::{rank_rows, LeaderboardEntry, LeaderboardKind, MessageStat, Setting, VoiceStat},
    schema::{messages, settings, voice},
};

pub const LAST_RESET_KEY: &str = "last_leaderboard_reset";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableCounts {
    pub messages: i64,
    pub voice: i64,
    pub settings: i64,
}

impl Database {
    pub fn increment_message(&self, actor_id: u64, delta: u64) -> bool {
        self.enqueue(|p| p.add_messages(actor_id as i64, delta as i64))
    }

    pub fn apply_voice_delta(&self, actor_id: u64, duration: Duration) -> bool {
        self.enqueue(|p| p.add_voice_time(actor_id as i64, duration.as_secs() as i64))
    }

    pub fn record_session_start(&self, actor_id: u64, at: DateTime<Utc>) -> bool {
        self.enqueue(|p| p.set_session(actor_id as i64, SessionChange::Started(at.naive_utc())))
    }

    pub fn record_session_end(&self, actor_id: u64) -> bool {
        self.enqueue(|p| p.set_session(actor_id as i64, SessionChange::Ended))
    }

    pub fn pending_message_delta(&self, actor_id: u64) -> u64 {
        self.pending().message_delta(actor_id as i64).max(0) as u64
    }

    pub fn pending_voice_delta(&self, actor_id: u64) -> Duration {
        Duration::from_secs(self.pending().voice_delta(actor_id as i64).max(0) as u64)
    }

    /// Ranked snapshot of flushed data. Actors with a zero metric are left out.
    pub async fn top_n(
        &self,
        kind: LeaderboardKind,
        n: usize,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let limit = n as i64;
        let rows = match kind {
            LeaderboardKind::Messages => {
                self.run(move |conn| {
                    messages::table
                        .filter(messages::count.gt(0))
                        .order((messages::count.desc(), messages::actor_id.asc()))
                        .select((messages::actor_id, messages::count))
                        .limit(limit)
                        .load::<(i64, i64)>(conn)
                })
                .await?
            }
            LeaderboardKind::Voice => {
                self.run(move |conn| {
                    voice::table
                        .filter(voice::total_time.gt(0))
                        .order((voice::total_time.desc(), voice::actor_id.asc()))
                        .select((voice::actor_id, voice::total_time))
                        .limit(limit)
                        .load::<(i64, i64)>(conn)
                })
                .await?
            }
        };
        Ok(rank_rows(rows))
    }

    pub async fn message_count(&self, actor_id: u64) -> Result<u64, StoreError> {
        let actor = actor_id as i64;
        let stat = self
            .run(move |conn| messages::table.find(actor).first::<MessageStat>(conn).optional())
            .await?;
        Ok(stat.map(|s| s.count.max(0) as u64).unwrap_or(0))
    }

    pub async fn voice_stat(&self, actor_id: u64) -> Result<Option<VoiceStat>, StoreError> {
        let actor = actor_id as i64;
        self.run(move |conn| voice::table.find(actor).first::<VoiceStat>(conn).optional())
            .await
    }

    /// Durable count plus whatever is still queued. Holds the flush gate so a
    /// batch in flight is counted exactly once.
    pub async fn message_total(&self, actor_id: u64) -> Result<u64, StoreError> {
        let _gate = self.flush_gate.lock().await;
        let durable = self.message_count(actor_id).await?;
        Ok(durable + self.pending_message_delta(actor_id))
    }

    pub async fn voice_total(&self, actor_id: u64) -> Result<Duration, StoreError> {
        let _gate = self.flush_gate.lock().await;
        let durable = self
            .voice_stat(actor_id)
            .await?
            .map(|stat| stat.total_time.max(0) as u64)
            .unwrap_or(0);
        Ok(Duration::from_secs(durable) + self.pending_voice_delta(actor_id))
    }

    /// Position on the board: actors with a higher metric, or an equal one
    /// and a lower id, come first. `None` without activity.
    pub async fn rank(
        &self,
        kind: LeaderboardKind,
        actor_id: u64,
    ) -> Result<Option<usize>, StoreError> {
        let actor = actor_id as i64;
        let ahead = match kind {
            LeaderboardKind::Messages => {
                self.run(move |conn| {
                    let Some(own) = messages::table
                        .find(actor)
                        .select(messages::count)
                        .first::<i64>(conn)
                        .optional()?
                        .filter(|c| *c > 0)
                    else {
                        return Ok(None);
                    };
                    messages::table
                        .filter(
                            messages::count.gt(own).or(messages::count
                                .eq(own)
                                .and(messages::actor_id.lt(actor))),
                        )
                        .count()
                        .get_result::<i64>(conn)
                        .map(Some)
                })
                .await?
            }
            LeaderboardKind::Voice => {
                self.run(move |conn| {
                    let Some(own) = voice::table
                        .find(actor)
                        .select(voice::total_time)
                        .first::<i64>(conn)
                        .optional()?
                        .filter(|t| *t > 0)
                    else {
                        return Ok(None);
                    };
                    voice::table
                        .filter(
                            voice::total_time.gt(own).or(voice::total_time
                                .eq(own)
                                .and(voice::actor_id.lt(actor))),
                        )
                        .count()
                        .get_result::<i64>(conn)
                        .map(Some)
                })
                .await?
            }
        };
        Ok(ahead.map(|n| n as usize + 1))
    }

    /// Wipes both activity relations, discards queued writes and stamps the
    /// reset time, all or nothing.
    pub async fn reset_all(&self, reset_at: DateTime<Utc>) -> Result<(), StoreError> {
        let _gate = self.flush_gate.lock().await;
        let stamp = Setting {
            key: LAST_RESET_KEY.to_string(),
            value: reset_at.timestamp().to_string(),
        };
        let (messages_cleared, voice_cleared) = self
            .run(move |conn| {
                conn.transaction(|conn| {
                    let m = diesel::delete(messages::table).execute(conn)?;
                    let v = diesel::delete(voice::table).execute(conn)?;
                    diesel::replace_into(settings::table)
                        .values(&stamp)
                        .execute(conn)?;
                    Ok((m, v))
                })
            })
            .await?;
        let dropped = self.pending().clear();
        self.bump_generation();
        info!(
            "Reset leaderboards: {} message rows, {} voice rows, {} queued writes discarded",
            messages_cleared, voice_cleared, dropped
        );
        Ok(())
    }

    /// Closes sessions left open by a previous process without crediting them.
    pub async fn clear_open_sessions(&self) -> Result<usize, StoreError> {
        let _gate = self.flush_gate.lock().await;
        self.run(|conn| {
            diesel::update(voice::table.filter(voice::session_start.is_not_null()))
                .set(voice::session_start.eq(None::<NaiveDateTime>))
                .execute(conn)
        })
        .await
    }

    pub async fn table_counts(&self) -> Result<TableCounts, StoreError> {
        self.run(|conn| {
            Ok(TableCounts {
                messages: messages::table.count().get_result(conn)?,
                voice: voice::table.count().get_result(conn)?,
                settings: settings::table.count().get_result(conn)?,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::database::test_support::temp_database;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn top_n_orders_by_metric_then_actor() {
        let (_dir, db) = temp_database();
        db.increment_message(30, 5);
        db.increment_message(10, 5);
        db.increment_message(20, 9);
        db.increment_message(40, 1);
        db.increment_message(50, 0);
        db.flush().await.unwrap();

        let top = db.top_n(LeaderboardKind::Messages, 3).await.unwrap();
        let order: Vec<(usize, u64, u64)> = top
            .iter()
            .map(|e| (e.rank, e.actor_id, e.metric_value))
            .collect();
        assert_eq!(order, vec![(1, 20, 9), (2, 10, 5), (3, 30, 5)]);

        let all = db.top_n(LeaderboardKind::Messages, 10).await.unwrap();
        assert_eq!(all.len(), 4, "zero counts are not ranked");
    }

    #[tokio::test]
    async fn top_n_ignores_pending_writes() {
        let (_dir, db) = temp_database();
        db.increment_message(1, 3);
        assert!(db.top_n(LeaderboardKind::Messages, 10).await.unwrap().is_empty());
        assert_eq!(db.message_total(1).await.unwrap(), 3);
        db.flush().await.unwrap();
        db.increment_message(1, 2);
        assert_eq!(db.message_count(1).await.unwrap(), 3);
        assert_eq!(db.message_total(1).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn voice_rows_track_session_start() {
        let (_dir, db) = temp_database();
        db.record_session_start(7, at(0));
        db.flush().await.unwrap();
        let stat = db.voice_stat(7).await.unwrap().unwrap();
        assert!(stat.in_voice());
        assert_eq!(stat.total_time, 0);

        db.apply_voice_delta(7, Duration::from_secs(120));
        db.record_session_end(7);
        db.flush().await.unwrap();
        let stat = db.voice_stat(7).await.unwrap().unwrap();
        assert!(!stat.in_voice());
        assert_eq!(stat.total_time, 120);

        let top = db.top_n(LeaderboardKind::Voice, 1).await.unwrap();
        assert_eq!(top[0].actor_id, 7);
        assert_eq!(top[0].metric_value, 120);
    }

    #[tokio::test]
    async fn rank_matches_board_position() {
        let (_dir, db) = temp_database();
        db.increment_message(2, 10);
        db.increment_message(1, 10);
        db.increment_message(3, 4);
        db.apply_voice_delta(5, Duration::from_secs(60));
        db.apply_voice_delta(4, Duration::from_secs(60));
        db.flush().await.unwrap();

        for kind in LeaderboardKind::ALL {
            for entry in db.top_n(kind, 10).await.unwrap() {
                assert_eq!(db.rank(kind, entry.actor_id).await.unwrap(), Some(entry.rank));
            }
        }
        assert_eq!(db.rank(LeaderboardKind::Messages, 1).await.unwrap(), Some(1));
        assert_eq!(db.rank(LeaderboardKind::Messages, 2).await.unwrap(), Some(2));
        assert_eq!(db.rank(LeaderboardKind::Messages, 3).await.unwrap(), Some(3));
        assert_eq!(db.rank(LeaderboardKind::Voice, 4).await.unwrap(), Some(1));
        assert_eq!(db.rank(LeaderboardKind::Messages, 99).await.unwrap(), None);
        assert_eq!(db.rank(LeaderboardKind::Voice, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reset_clears_rows_queue_and_stamps_setting() {
        let (_dir, db) = temp_database();
        db.increment_message(1, 4);
        db.apply_voice_delta(1, Duration::from_secs(60));
        db.flush().await.unwrap();
        db.increment_message(2, 1);

        db.reset_all(at(0)).await.unwrap();

        let counts = db.table_counts().await.unwrap();
        assert_eq!((counts.messages, counts.voice), (0, 0));
        assert_eq!(db.pending_len(), 0);
        assert_eq!(
            db.get_setting(LAST_RESET_KEY).await.unwrap(),
            Some(at(0).timestamp().to_string())
        );
    }

    #[tokio::test]
    async fn open_sessions_are_closed_without_credit() {
        let (_dir, db) = temp_database();
        db.apply_voice_delta(3, Duration::from_secs(30));
        db.record_session_start(3, at(0));
        db.record_session_start(4, at(5));
        db.flush().await.unwrap();

        assert_eq!(db.clear_open_sessions().await.unwrap(), 2);
        let stat = db.voice_stat(3).await.unwrap().unwrap();
        assert_eq!(stat.session_start, None);
        assert_eq!(stat.total_time, 30);
    }
}
