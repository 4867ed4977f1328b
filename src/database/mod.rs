use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use diesel::{
    connection::SimpleConnection,
    r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection},
    sqlite::SqliteConnection,
};
use rand::Rng;

use crate::{config::StoreConfig, error::StoreError, schema::CREATE_TABLES};

pub mod activity;
pub mod batch;
pub mod settings;

use batch::PendingWrites;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct ConnectionOptions {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;",
            self.busy_timeout.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    flushed_batches: AtomicU64,
    dropped_batches: AtomicU64,
    rows_written: AtomicU64,
    flush_retries: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub pending_ops: usize,
    pub flushed_batches: u64,
    pub dropped_batches: u64,
    pub rows_written: u64,
    pub flush_retries: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub ops: usize,
    pub rows: usize,
    pub attempts: u32,
}

pub struct Database {
    pool: DbPool,
    acquire_timeout: Duration,
    batch_size: usize,
    flush_max_attempts: u32,
    flush_backoff: Duration,
    pending: Mutex<PendingWrites>,
    // Serializes flushes against resets and consistent reads.
    flush_gate: tokio::sync::Mutex<()>,
    // Bumped whenever queued writes leave the queue or the tables are wiped.
    generation: AtomicU64,
    counters: StoreCounters,
}

impl Database {
    pub fn new(config: &StoreConfig) -> Result<Database, StoreError> {
        let manager = ConnectionManager::<SqliteConnection>::new(&config.database_url);
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.acquire_timeout)
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout: config.acquire_timeout,
            }))
            .build(manager)?;

        let mut conn = pool
            .get_timeout(config.acquire_timeout)
            .map_err(|_| StoreError::PoolExhausted(config.acquire_timeout))?;
        conn.batch_execute(CREATE_TABLES)?;
        drop(conn);

        info!(
            "Opened {} with a pool of {} connections",
            config.database_url, config.pool_size
        );

        Ok(Database {
            pool,
            acquire_timeout: config.acquire_timeout,
            batch_size: config.batch_size,
            flush_max_attempts: config.flush_max_attempts,
            flush_backoff: config.flush_backoff,
            pending: Mutex::new(PendingWrites::default()),
            flush_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            counters: StoreCounters::default(),
        })
    }

    /// Blocks up to the configured timeout for a free connection.
    pub fn conn(&self) -> Result<DbConnection, StoreError> {
        self.pool
            .get_timeout(self.acquire_timeout)
            .map_err(|_| StoreError::PoolExhausted(self.acquire_timeout))
    }

    /// Runs `query` on the blocking pool with a pooled connection.
    async fn run<T, F>(&self, query: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut SqliteConnection) -> diesel::QueryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let timeout = self.acquire_timeout;
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get_timeout(timeout)
                .map_err(|_| StoreError::PoolExhausted(timeout))?;
            query(&mut *conn).map_err(StoreError::from)
        })
        .await?
    }

    fn pending(&self) -> MutexGuard<'_, PendingWrites> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `write` to the queue. Returns `true` once the queue has reached
    /// the flush threshold.
    fn enqueue<F>(&self, write: F) -> bool
    where
        F: FnOnce(&mut PendingWrites),
    {
        let mut pending = self.pending();
        write(&mut pending);
        pending.len() >= self.batch_size
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drains the queue into one transaction, retrying with exponential
    /// backoff. A batch that still fails after the last attempt is dropped.
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        let _gate = self.flush_gate.lock().await;
        let batch = Arc::new(self.pending().take());
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let mut delay = self.flush_backoff;
        let mut attempt = 1;
        loop {
            let job = batch.clone();
            match self.run(move |conn| batch::apply(conn, job)).await {
                Ok(rows) => {
                    self.bump_generation();
                    self.counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .rows_written
                        .fetch_add(rows as u64, Ordering::Relaxed);
                    debug!(
                        "Flushed {} queued writes into {} rows (attempt {})",
                        batch.ops, rows, attempt
                    );
                    return Ok(FlushReport {
                        ops: batch.ops,
                        rows,
                        attempts: attempt,
                    });
                }
                Err(e) if attempt < self.flush_max_attempts => {
                    warn!("Flush attempt {} failed, retrying in {:?}: {}", attempt, delay, e);
                    self.counters.flush_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(with_jitter(delay)).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) => {
                    self.bump_generation();
                    self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Dropping batch of {} writes ({} rows) after {} attempts: {}",
                        batch.ops,
                        batch.rows(),
                        attempt,
                        e
                    );
                    return Err(StoreError::FlushFailed {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            pending_ops: self.pending_len(),
            flushed_batches: self.counters.flushed_batches.load(Ordering::Relaxed),
            dropped_batches: self.counters.dropped_batches.load(Ordering::Relaxed),
            rows_written: self.counters.rows_written.load(Ordering::Relaxed),
            flush_retries: self.counters.flush_retries.load(Ordering::Relaxed),
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() as u64 / 4).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
}
