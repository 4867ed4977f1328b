//! Orchestration of admission, voice sessions, the cache and the durable
//! store. Every mutating operation updates the cache and enqueues the durable
//! write as one step.
//!
//! Event intake never waits on the store. Reads that fill the cache from the
//! store remember the store generation and the write count they started at,
//! and drop their entry again if either moved while they were reading.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{futures::Notified, Notify};

use crate::{
    cache::{Cache, CacheStats},
    config::{Config, LeaderboardConfig},
    database::{activity::LAST_RESET_KEY, Database, FlushReport, StoreStats},
    error::{EventError, StoreError},
    models::{
        ActivityEvent, ActorStats, EventKind, Leaderboard, LeaderboardEntry, LeaderboardKind,
        VoiceEventKind,
    },
    rate_limiter::RateLimiter,
    voice::VoiceSessionTracker,
};

const EVENT_COST: u32 = 1;
const MAX_FUTURE_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Leaderboard(LeaderboardKind, usize),
    Counter(LeaderboardKind, u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Ranking(Vec<LeaderboardEntry>),
    Counter(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// Rejected by the rate limiter. Nothing was changed.
    Throttled,
    /// Duplicate join or unmatched leave.
    Ignored,
}

#[derive(Debug, Default)]
struct ServiceCounters {
    messages_tracked: AtomicU64,
    voice_updates: AtomicU64,
    throttled: AtomicU64,
    invalid_events: AtomicU64,
    leaderboard_reads: AtomicU64,
    stale_reads: AtomicU64,
    resets: AtomicU64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub messages_tracked: u64,
    pub voice_updates: u64,
    pub throttled: u64,
    pub invalid_events: u64,
    pub leaderboard_reads: u64,
    pub stale_reads: u64,
    pub resets: u64,
    pub active_voice_sessions: usize,
    pub rate_limited_actors: usize,
    pub cache: CacheStats,
    pub store: StoreStats,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_entries: usize,
    pub idle_buckets: usize,
}

/// Counts counter-affecting writes as they start and finish.
#[derive(Debug, Default)]
struct WriteTracker {
    started: AtomicU64,
    finished: AtomicU64,
}

struct WriteGuard<'a>(&'a WriteTracker);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.finished.fetch_add(1, Ordering::SeqCst);
    }
}

impl WriteTracker {
    fn begin(&self) -> WriteGuard<'_> {
        self.started.fetch_add(1, Ordering::SeqCst);
        WriteGuard(self)
    }

    fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// `Some(started)` when no write is in flight.
    fn settled(&self) -> Option<u64> {
        let started = self.started();
        (self.finished.load(Ordering::SeqCst) == started).then_some(started)
    }
}

/// Where a store read started, for deciding whether its result may be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadMark {
    generation: u64,
    writes: Option<u64>,
}

pub struct ActivityService {
    db: Database,
    cache: Cache<CacheKey, CachedValue>,
    limiter: RateLimiter,
    sessions: Mutex<VoiceSessionTracker>,
    leaderboard: LeaderboardConfig,
    idle_eviction: Duration,
    writes: WriteTracker,
    // Serializes reset cycles only. Event intake never takes it.
    reset_lock: tokio::sync::Mutex<()>,
    flush_signal: Notify,
    counters: ServiceCounters,
}

impl ActivityService {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            cache: Cache::new(
                config.cache.capacity,
                config.cache.ttl,
                config.cache.stale_grace,
            ),
            limiter: RateLimiter::new(&config.rate_limit),
            sessions: Mutex::new(VoiceSessionTracker::new()),
            leaderboard: config.leaderboard.clone(),
            idle_eviction: config.rate_limit.idle_eviction,
            writes: WriteTracker::default(),
            reset_lock: tokio::sync::Mutex::new(()),
            flush_signal: Notify::new(),
            counters: ServiceCounters::default(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn default_leaderboard_size(&self) -> usize {
        self.leaderboard.default_size
    }

    fn sessions(&self) -> MutexGuard<'_, VoiceSessionTracker> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once the write queue crosses its size threshold.
    pub fn flush_requested(&self) -> Notified<'_> {
        self.flush_signal.notified()
    }

    fn read_mark(&self, track_writes: bool) -> ReadMark {
        ReadMark {
            generation: self.db.generation(),
            writes: if track_writes {
                self.writes.settled()
            } else {
                None
            },
        }
    }

    /// Caches a value read from the store unless a flush, a reset or (for
    /// counters) an event landed while it was being read.
    fn cache_if_current(&self, key: CacheKey, value: CachedValue, mark: ReadMark) -> bool {
        let track_writes = matches!(key, CacheKey::Counter(..));
        if track_writes && mark.writes.is_none() {
            return false;
        }
        self.cache.insert(key.clone(), value);
        let moved = self.db.generation() != mark.generation
            || (track_writes && mark.writes != Some(self.writes.started()));
        if moved {
            self.cache.invalidate(&key);
        }
        !moved
    }

    pub async fn handle_event(&self, event: ActivityEvent) -> Result<RecordOutcome, EventError> {
        if let Err(e) = validate(&event, Utc::now()) {
            self.counters.invalid_events.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping invalid event {:?}: {}", event, e);
            return Err(e);
        }
        Ok(match event.kind {
            EventKind::Message => self.record_message(event.actor_id).await,
            EventKind::Voice(kind) => {
                self.record_voice_event(event.actor_id, kind, event.timestamp)
                    .await
            }
        })
    }

    pub async fn record_message(&self, actor_id: u64) -> RecordOutcome {
        if !self.limiter.try_admit(actor_id, EVENT_COST) {
            self.counters.throttled.fetch_add(1, Ordering::Relaxed);
            trace!("Throttled message from {}", actor_id);
            return RecordOutcome::Throttled;
        }

        let flush_due = {
            let _write = self.writes.begin();
            let key = CacheKey::Counter(LeaderboardKind::Messages, actor_id);
            self.cache.update_fresh(&key, |value| {
                if let CachedValue::Counter(count) = value {
                    *count += 1;
                }
            });
            self.db.increment_message(actor_id, 1)
        };

        self.counters.messages_tracked.fetch_add(1, Ordering::Relaxed);
        if flush_due {
            self.flush_signal.notify_one();
        }
        RecordOutcome::Recorded
    }

    /// Voice events bypass the rate limiter: a dropped leave would keep the
    /// session open and credit the gap on the next one.
    pub async fn record_voice_event(
        &self,
        actor_id: u64,
        kind: VoiceEventKind,
        timestamp: DateTime<Utc>,
    ) -> RecordOutcome {
        let flush_due = {
            let _write = self.writes.begin();
            match kind {
                VoiceEventKind::Join => {
                    if !self.sessions().on_join(actor_id, timestamp) {
                        trace!("{} joined voice while already active", actor_id);
                        return RecordOutcome::Ignored;
                    }
                    self.db.record_session_start(actor_id, timestamp)
                }
                VoiceEventKind::Leave => {
                    let elapsed = match self.sessions().on_leave(actor_id, timestamp) {
                        Some(elapsed) => elapsed,
                        None => {
                            trace!("{} left voice without an open session", actor_id);
                            return RecordOutcome::Ignored;
                        }
                    };
                    let seconds = elapsed.as_secs();
                    let key = CacheKey::Counter(LeaderboardKind::Voice, actor_id);
                    self.cache.update_fresh(&key, |value| {
                        if let CachedValue::Counter(total) = value {
                            *total += seconds;
                        }
                    });
                    let delta_due = self.db.apply_voice_delta(actor_id, elapsed);
                    self.db.record_session_end(actor_id) || delta_due
                }
            }
        };

        self.counters.voice_updates.fetch_add(1, Ordering::Relaxed);
        if flush_due {
            self.flush_signal.notify_one();
        }
        RecordOutcome::Recorded
    }

    /// Cache-first ranked view. When the store is unreachable the last cached
    /// ranking is returned with `stale` set, even past its TTL.
    pub async fn get_leaderboard(
        &self,
        kind: LeaderboardKind,
        top_n: usize,
    ) -> Result<Leaderboard, StoreError> {
        self.counters.leaderboard_reads.fetch_add(1, Ordering::Relaxed);
        let n = top_n.min(self.leaderboard.max_size);
        if n == 0 {
            return Ok(Leaderboard::empty(kind));
        }

        let key = CacheKey::Leaderboard(kind, n);
        if let Some(CachedValue::Ranking(entries)) = self.cache.get(&key) {
            return Ok(Leaderboard {
                kind,
                entries,
                stale: false,
            });
        }

        let mark = self.read_mark(false);
        match self.db.top_n(kind, n).await {
            Ok(entries) => {
                self.cache_if_current(key, CachedValue::Ranking(entries.clone()), mark);
                Ok(Leaderboard {
                    kind,
                    entries,
                    stale: false,
                })
            }
            Err(e) => match self.cache.get_stale(&key) {
                Some(CachedValue::Ranking(entries)) => {
                    warn!("Serving stale {} leaderboard: {}", kind, e);
                    self.counters.stale_reads.fetch_add(1, Ordering::Relaxed);
                    Ok(Leaderboard {
                        kind,
                        entries,
                        stale: true,
                    })
                }
                _ => {
                    error!("No {} leaderboard available: {}", kind, e);
                    Err(e)
                }
            },
        }
    }

    /// Drops every cached ranked view so the next read goes to the store.
    pub fn refresh_rankings(&self) -> usize {
        self.cache
            .invalidate_where(|key| matches!(key, CacheKey::Leaderboard(..)))
    }

    pub async fn actor_stats(&self, actor_id: u64) -> Result<ActorStats, StoreError> {
        let messages = self.counter(LeaderboardKind::Messages, actor_id).await?;
        let voice_seconds = self.counter(LeaderboardKind::Voice, actor_id).await?;
        let current_session = self
            .sessions()
            .session_start(actor_id)
            .map(|start| (Utc::now() - start).to_std().unwrap_or(Duration::ZERO));

        Ok(ActorStats {
            actor_id,
            messages,
            voice_time: Duration::from_secs(voice_seconds),
            current_session,
            message_rank: self.db.rank(LeaderboardKind::Messages, actor_id).await?,
            voice_rank: self.db.rank(LeaderboardKind::Voice, actor_id).await?,
        })
    }

    /// Per-actor total including queued writes, cached after the first read.
    async fn counter(&self, kind: LeaderboardKind, actor_id: u64) -> Result<u64, StoreError> {
        let key = CacheKey::Counter(kind, actor_id);
        if let Some(CachedValue::Counter(value)) = self.cache.get(&key) {
            return Ok(value);
        }

        let mark = self.read_mark(true);
        let value = match kind {
            LeaderboardKind::Messages => self.db.message_total(actor_id).await?,
            LeaderboardKind::Voice => self.db.voice_total(actor_id).await?.as_secs(),
        };
        self.cache_if_current(key, CachedValue::Counter(value), mark);
        Ok(value)
    }

    /// Flushes the write queue. A committed batch invalidates the ranked
    /// views; a dropped one invalidates the per-actor counters that counted it.
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        match self.db.flush().await {
            Ok(report) => {
                if report.rows > 0 {
                    self.refresh_rankings();
                }
                Ok(report)
            }
            Err(e) => {
                self.cache
                    .invalidate_where(|key| matches!(key, CacheKey::Counter(..)));
                Err(e)
            }
        }
    }

    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            expired_entries: self.cache.sweep(),
            idle_buckets: self.limiter.evict_idle(self.idle_eviction),
        };
        if report.idle_buckets > 0 {
            debug!("Evicted {} idle rate limit buckets", report.idle_buckets);
        }
        report
    }

    pub async fn reset_due(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let last_reset = match self.db.get_setting(LAST_RESET_KEY).await? {
            Some(raw) => raw,
            None => return Ok(true),
        };
        match last_reset.parse::<i64>() {
            Ok(last) => {
                Ok(now.timestamp() - last >= self.leaderboard.reset_period.num_seconds())
            }
            Err(_) => {
                warn!(
                    "Unreadable {} setting {:?}, not resetting",
                    LAST_RESET_KEY, last_reset
                );
                Ok(false)
            }
        }
    }

    /// Starts a new cycle if the current one is over. Returns whether a reset
    /// happened; calling again inside the same window does nothing.
    pub async fn run_reset_cycle(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if !self.reset_due(now).await? {
            return Ok(false);
        }
        let _reset = self.reset_lock.lock().await;
        // a concurrent cycle may have finished while we waited
        if !self.reset_due(now).await? {
            return Ok(false);
        }

        self.db.reset_all(now).await?;
        let purged = self.cache.clear();
        let forfeited = self.sessions().force_idle_all();
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
        info!(
            "Started a new leaderboard cycle: {} cache entries purged, \
             {} open voice sessions forfeited",
            purged, forfeited
        );
        Ok(true)
    }

    /// Startup recovery: sessions open in the store belong to a previous
    /// process and are closed without credit.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let closed = self.db.clear_open_sessions().await?;
        if closed > 0 {
            info!("Closed {} voice sessions left open by the previous run", closed);
        }
        Ok(closed)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let c = &self.counters;
        MetricsSnapshot {
            messages_tracked: c.messages_tracked.load(Ordering::Relaxed),
            voice_updates: c.voice_updates.load(Ordering::Relaxed),
            throttled: c.throttled.load(Ordering::Relaxed),
            invalid_events: c.invalid_events.load(Ordering::Relaxed),
            leaderboard_reads: c.leaderboard_reads.load(Ordering::Relaxed),
            stale_reads: c.stale_reads.load(Ordering::Relaxed),
            resets: c.resets.load(Ordering::Relaxed),
            active_voice_sessions: self.sessions().active_count(),
            rate_limited_actors: self.limiter.len(),
            cache: self.cache.stats(),
            store: self.db.stats(),
        }
    }
}

fn validate(event: &ActivityEvent, now: DateTime<Utc>) -> Result<(), EventError> {
    if event.actor_id == 0 {
        return Err(EventError::MissingActor);
    }
    if event.timestamp > now + chrono::Duration::seconds(MAX_FUTURE_SKEW_SECS) {
        return Err(EventError::FutureTimestamp(event.timestamp));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    pub(crate) fn service_with<F>(adjust: F) -> (TempDir, ActivityService)
    where
        F: FnOnce(&mut Config),
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaderboard.db");
        let mut config = Config::for_tests(path.to_str().unwrap());
        adjust(&mut config);
        let db = Database::new(&config.store).unwrap();
        (dir, ActivityService::new(db, &config))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn messages_and_voice_end_to_end() {
        let (_dir, service) = service_with(|_| {});
        let actor = 1234;
        for _ in 0..3 {
            assert_eq!(service.record_message(actor).await, RecordOutcome::Recorded);
        }
        assert_eq!(
            service.record_voice_event(actor, VoiceEventKind::Join, at(0)).await,
            RecordOutcome::Recorded
        );
        assert_eq!(
            service.record_voice_event(actor, VoiceEventKind::Leave, at(120)).await,
            RecordOutcome::Recorded
        );
        service.flush().await.unwrap();

        let stats = service.actor_stats(actor).await.unwrap();
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.voice_time, Duration::from_secs(120));
        assert_eq!(stats.current_session, None);
        assert_eq!(stats.message_rank, Some(1));

        let board = service.get_leaderboard(LeaderboardKind::Voice, 1).await.unwrap();
        assert!(!board.stale);
        assert_eq!(
            board.entries,
            vec![LeaderboardEntry {
                rank: 1,
                actor_id: actor,
                metric_value: 120
            }]
        );
    }

    #[tokio::test]
    async fn throttled_messages_leave_no_trace() {
        let (_dir, service) = service_with(|c| {
            c.rate_limit.capacity = 2;
            c.rate_limit.refill_per_sec = 0.001;
        });
        assert_eq!(service.record_message(5).await, RecordOutcome::Recorded);
        assert_eq!(service.record_message(5).await, RecordOutcome::Recorded);
        assert_eq!(service.record_message(5).await, RecordOutcome::Throttled);

        assert_eq!(service.database().pending_len(), 2);
        let metrics = service.metrics();
        assert_eq!(metrics.throttled, 1);
        assert_eq!(metrics.messages_tracked, 2);
    }

    #[tokio::test]
    async fn duplicate_voice_events_are_ignored() {
        let (_dir, service) = service_with(|_| {});
        use VoiceEventKind::*;
        assert_eq!(service.record_voice_event(9, Leave, at(0)).await, RecordOutcome::Ignored);
        assert_eq!(service.record_voice_event(9, Join, at(10)).await, RecordOutcome::Recorded);
        assert_eq!(service.record_voice_event(9, Join, at(20)).await, RecordOutcome::Ignored);
        assert_eq!(service.record_voice_event(9, Leave, at(70)).await, RecordOutcome::Recorded);
        assert_eq!(service.record_voice_event(9, Leave, at(80)).await, RecordOutcome::Ignored);
        service.flush().await.unwrap();

        let stat = service.database().voice_stat(9).await.unwrap().unwrap();
        assert_eq!(stat.total_time, 60);
        assert_eq!(stat.session_start, None);
    }

    #[tokio::test]
    async fn leaderboard_served_from_cache_until_flush() {
        let (_dir, service) = service_with(|_| {});
        service.record_message(1).await;
        service.flush().await.unwrap();

        let first = service.get_leaderboard(LeaderboardKind::Messages, 10).await.unwrap();
        assert_eq!(first.entries.len(), 1);

        service.record_message(2).await;
        service.record_message(2).await;
        let cached = service.get_leaderboard(LeaderboardKind::Messages, 10).await.unwrap();
        assert_eq!(cached, first);

        service.flush().await.unwrap();
        let fresh = service.get_leaderboard(LeaderboardKind::Messages, 10).await.unwrap();
        let ids: Vec<u64> = fresh.entries.iter().map(|e| e.actor_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(service.metrics().cache.hits >= 1);
    }

    #[tokio::test]
    async fn leaderboard_length_is_bounded() {
        let (_dir, service) = service_with(|_| {});
        for actor in 1..=12 {
            service.record_message(actor).await;
        }
        service.flush().await.unwrap();

        let board = service.get_leaderboard(LeaderboardKind::Messages, 50).await.unwrap();
        assert_eq!(board.entries.len(), 10);
        // equal counts fall back to ascending actor ids
        let ids: Vec<u64> = board.entries.iter().map(|e| e.actor_id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<u64>>());

        let small = service.get_leaderboard(LeaderboardKind::Messages, 3).await.unwrap();
        assert_eq!(small.entries.len(), 3);
        assert!(service
            .get_leaderboard(LeaderboardKind::Messages, 0)
            .await
            .unwrap()
            .entries
            .is_empty());
        assert!(service
            .get_leaderboard(LeaderboardKind::Voice, 10)
            .await
            .unwrap()
            .entries
            .is_empty());
    }

    #[tokio::test]
    async fn outage_serves_stale_ranking() {
        let (_dir, service) = service_with(|c| {
            c.store.pool_size = 1;
            c.store.acquire_timeout = Duration::from_millis(50);
            c.cache.ttl = Duration::ZERO;
        });
        service.record_message(3).await;
        service.flush().await.unwrap();
        let live = service.get_leaderboard(LeaderboardKind::Messages, 5).await.unwrap();
        assert!(!live.stale);

        let held = service.database().conn().unwrap();
        let stale = service.get_leaderboard(LeaderboardKind::Messages, 5).await.unwrap();
        assert!(stale.stale);
        assert_eq!(stale.entries, live.entries);

        let err = service.get_leaderboard(LeaderboardKind::Voice, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::PoolExhausted(_)));
        drop(held);

        assert_eq!(service.metrics().stale_reads, 1);
    }

    #[tokio::test]
    async fn reset_cycle_clears_everything_once_per_window() {
        let (_dir, service) = service_with(|_| {});
        let now = Utc::now();
        service.record_message(1).await;
        service.record_voice_event(2, VoiceEventKind::Join, now).await;
        service
            .record_voice_event(2, VoiceEventKind::Leave, now + chrono::Duration::seconds(30))
            .await;
        service.record_voice_event(3, VoiceEventKind::Join, now).await;
        service.flush().await.unwrap();
        service.get_leaderboard(LeaderboardKind::Messages, 10).await.unwrap();
        service.record_message(1).await;

        assert!(service.run_reset_cycle(now).await.unwrap());

        assert_eq!(service.metrics().cache.size, 0);
        assert_eq!(service.metrics().active_voice_sessions, 0);
        assert_eq!(service.database().pending_len(), 0);
        for kind in LeaderboardKind::ALL {
            assert!(service.get_leaderboard(kind, 10).await.unwrap().entries.is_empty());
        }
        let stats = service.actor_stats(1).await.unwrap();
        assert_eq!(stats.messages, 0);
        // the forfeited session cannot be closed anymore
        assert_eq!(
            service
                .record_voice_event(3, VoiceEventKind::Leave, now + chrono::Duration::seconds(60))
                .await,
            RecordOutcome::Ignored
        );

        let stamp = service.database().get_setting(LAST_RESET_KEY).await.unwrap();
        assert!(!service
            .run_reset_cycle(now + chrono::Duration::days(1))
            .await
            .unwrap());
        assert_eq!(service.database().get_setting(LAST_RESET_KEY).await.unwrap(), stamp);

        assert!(service
            .run_reset_cycle(now + chrono::Duration::days(30))
            .await
            .unwrap());
        assert_eq!(service.metrics().resets, 2);
    }

    #[tokio::test]
    async fn cached_counters_follow_new_events() {
        let (_dir, service) = service_with(|_| {});
        assert_eq!(service.actor_stats(8).await.unwrap().messages, 0);
        service.record_message(8).await;
        service.record_message(8).await;
        assert_eq!(service.actor_stats(8).await.unwrap().messages, 2);
        service.flush().await.unwrap();
        assert_eq!(service.actor_stats(8).await.unwrap().messages, 2);
        assert_eq!(service.actor_stats(8).await.unwrap().message_rank, Some(1));
    }

    #[tokio::test]
    async fn invalid_events_are_counted_and_dropped() {
        let (_dir, service) = service_with(|_| {});
        let now = Utc::now();
        assert_eq!(
            service.handle_event(ActivityEvent::message(0, now)).await,
            Err(EventError::MissingActor)
        );
        let future = now + chrono::Duration::hours(2);
        assert_eq!(
            service
                .handle_event(ActivityEvent::voice(4, VoiceEventKind::Join, future))
                .await,
            Err(EventError::FutureTimestamp(future))
        );
        assert_eq!(
            service.handle_event(ActivityEvent::message(4, now)).await,
            Ok(RecordOutcome::Recorded)
        );
        assert_eq!(service.metrics().invalid_events, 2);
        assert_eq!(service.database().pending_len(), 1);
    }

    #[tokio::test]
    async fn recover_closes_sessions_from_previous_run() {
        let (_dir, service) = service_with(|_| {});
        service.database().record_session_start(6, at(0));
        service.database().flush().await.unwrap();

        assert_eq!(service.recover().await.unwrap(), 1);
        assert_eq!(service.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn size_threshold_wakes_the_flusher() {
        let (_dir, service) = service_with(|c| c.store.batch_size = 2);
        let woken = service.flush_requested();
        tokio::pin!(woken);
        service.record_message(1).await;
        service.record_message(1).await;
        tokio::time::timeout(Duration::from_secs(1), woken)
            .await
            .expect("flush signal");
    }

    #[tokio::test]
    async fn event_intake_is_not_stalled_by_store_reads() {
        let (_dir, service) = service_with(|c| {
            c.store.pool_size = 1;
            c.store.acquire_timeout = Duration::from_millis(1500);
        });
        let service = std::sync::Arc::new(service);
        let held = service.database().conn().unwrap();

        let reader = tokio::spawn({
            let service = service.clone();
            async move { service.actor_stats(1).await.is_ok() }
        });
        let resetter = tokio::spawn({
            let service = service.clone();
            async move { service.run_reset_cycle(Utc::now()).await.is_ok() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert_eq!(service.record_message(2).await, RecordOutcome::Recorded);
        assert_eq!(
            service
                .record_voice_event(2, VoiceEventKind::Join, Utc::now())
                .await,
            RecordOutcome::Recorded
        );
        assert!(started.elapsed() < Duration::from_millis(250));

        drop(held);
        let _ = reader.await;
        let _ = resetter.await;
    }

    #[tokio::test]
    async fn concurrent_reset_cycles_reset_once() {
        let (_dir, service) = service_with(|_| {});
        let now = Utc::now();
        let (a, b) = tokio::join!(service.run_reset_cycle(now), service.run_reset_cycle(now));
        assert!(a.unwrap() ^ b.unwrap());
        assert_eq!(service.metrics().resets, 1);
    }

    #[tokio::test]
    async fn ranking_read_across_a_flush_is_not_cached() {
        let (_dir, service) = service_with(|_| {});
        service.record_message(1).await;
        service.flush().await.unwrap();

        let key = CacheKey::Leaderboard(LeaderboardKind::Messages, 10);
        let mark = service.read_mark(false);
        let old = service
            .database()
            .top_n(LeaderboardKind::Messages, 10)
            .await
            .unwrap();
        service.record_message(2).await;
        service.record_message(2).await;
        service.flush().await.unwrap();

        assert!(!service.cache_if_current(key.clone(), CachedValue::Ranking(old), mark));
        assert_eq!(service.cache.get_stale(&key), None);
        let board = service.get_leaderboard(LeaderboardKind::Messages, 10).await.unwrap();
        let ids: Vec<u64> = board.entries.iter().map(|e| e.actor_id).collect();
        assert_eq!(ids, vec![2, 1]);

        let mark = service.read_mark(false);
        assert!(service.cache_if_current(key, CachedValue::Ranking(board.entries), mark));
    }

    #[tokio::test]
    async fn counter_read_across_an_event_is_not_cached() {
        let (_dir, service) = service_with(|_| {});
        let key = CacheKey::Counter(LeaderboardKind::Messages, 7);
        let mark = service.read_mark(true);
        let old = service.database().message_total(7).await.unwrap();
        service.record_message(7).await;

        assert!(!service.cache_if_current(key.clone(), CachedValue::Counter(old), mark));
        assert_eq!(service.cache.get_stale(&key), None);
        assert_eq!(service.actor_stats(7).await.unwrap().messages, 1);
        assert_eq!(service.cache.get(&key), Some(CachedValue::Counter(1)));
    }
}
