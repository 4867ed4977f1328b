//! Voice presence as a per-actor two-state machine.
//!
//! An actor with a recorded session start is Active, everyone else is Idle.
//! Duplicate joins and unmatched leaves are ignored so at-least-once delivery
//! from the gateway cannot double count.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct VoiceSessionTracker {
    sessions: HashMap<u64, DateTime<Utc>>,
}

impl VoiceSessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle -> Active. Returns `false` if the actor was already Active.
    pub fn on_join(&mut self, actor_id: u64, now: DateTime<Utc>) -> bool {
        if self.sessions.contains_key(&actor_id) {
            return false;
        }
        self.sessions.insert(actor_id, now);
        true
    }

    /// Active -> Idle, yielding the session length in whole seconds, taken
    /// between the truncated timestamps so split sessions add up exactly. A
    /// leave that lands before its join (clock skew) yields zero.
    pub fn on_leave(&mut self, actor_id: u64, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.sessions.remove(&actor_id)?;
        let seconds = (now.timestamp() - started.timestamp()).max(0);
        Some(Duration::from_secs(seconds as u64))
    }

    /// Closes every open session without crediting it.
    pub fn force_idle_all(&mut self) -> usize {
        let open = self.sessions.len();
        self.sessions.clear();
        open
    }

    pub fn session_start(&self, actor_id: u64) -> Option<DateTime<Utc>> {
        self.sessions.get(&actor_id).copied()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}
