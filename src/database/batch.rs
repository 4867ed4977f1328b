//! Pending durable writes, coalesced per actor until the next flush.

use std::{collections::HashMap, sync::Arc};

use chrono::NaiveDateTime;
use diesel::{prelude::*, sqlite::SqliteConnection};

use crate::schema::{messages, voice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    Started(NaiveDateTime),
    Ended,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VoiceWrite {
    pub seconds: i64,
    /// Last session change wins.
    pub session: Option<SessionChange>,
}

#[derive(Debug, Default)]
pub struct PendingWrites {
    messages: HashMap<i64, i64>,
    voice: HashMap<i64, VoiceWrite>,
    ops: usize,
}

impl PendingWrites {
    pub fn add_messages(&mut self, actor_id: i64, delta: i64) {
        *self.messages.entry(actor_id).or_insert(0) += delta;
        self.ops += 1;
    }

    pub fn add_voice_time(&mut self, actor_id: i64, seconds: i64) {
        self.voice.entry(actor_id).or_default().seconds += seconds;
        self.ops += 1;
    }

    pub fn set_session(&mut self, actor_id: i64, change: SessionChange) {
        self.voice.entry(actor_id).or_default().session = Some(change);
        self.ops += 1;
    }

    /// Operations enqueued since the last drain, before coalescing.
    pub fn len(&self) -> usize {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }

    pub fn message_delta(&self, actor_id: i64) -> i64 {
        self.messages.get(&actor_id).copied().unwrap_or(0)
    }

    pub fn voice_delta(&self, actor_id: i64) -> i64 {
        self.voice.get(&actor_id).map(|w| w.seconds).unwrap_or(0)
    }

    pub fn take(&mut self) -> Batch {
        let batch = Batch {
            messages: self.messages.drain().collect(),
            voice: self.voice.drain().collect(),
            ops: self.ops,
        };
        self.ops = 0;
        batch
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.ops;
        self.messages.clear();
        self.voice.clear();
        self.ops = 0;
        dropped
    }
}

#[derive(Debug, Default, Clone)]
pub struct Batch {
    pub messages: Vec<(i64, i64)>,
    pub voice: Vec<(i64, VoiceWrite)>,
    pub ops: usize,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.voice.is_empty()
    }

    pub fn rows(&self) -> usize {
        self.messages.len() + self.voice.len()
    }
}

/// Writes the whole batch in one transaction. Returns the number of rows
/// touched.
pub fn apply(conn: &mut SqliteConnection, batch: Arc<Batch>) -> QueryResult<usize> {
    conn.transaction(|conn| {
        let mut rows = 0;
        for &(actor, delta) in &batch.messages {
            rows += diesel::insert_into(messages::table)
                .values((messages::actor_id.eq(actor), messages::count.eq(delta)))
                .on_conflict(messages::actor_id)
                .do_update()
                .set(messages::count.eq(messages::count + delta))
                .execute(conn)?;
        }

        for (actor, write) in &batch.voice {
            let start = match write.session {
                Some(SessionChange::Started(ts)) => Some(ts),
                _ => None,
            };
            let upsert = diesel::insert_into(voice::table)
                .values((
                    voice::actor_id.eq(*actor),
                    voice::total_time.eq(write.seconds),
                    voice::session_start.eq(start),
                ))
                .on_conflict(voice::actor_id)
                .do_update();
            rows += match write.session {
                Some(_) => upsert
                    .set((
                        voice::total_time.eq(voice::total_time + write.seconds),
                        voice::session_start.eq(start),
                    ))
                    .execute(conn)?,
                None => upsert
                    .set(voice::total_time.eq(voice::total_time + write.seconds))
                    .execute(conn)?,
            };
        }
        Ok(rows)
    })
}
