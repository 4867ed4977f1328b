//! Per-actor token buckets guarding event admission.
//!
//! Buckets live in a sharded map so two actors never contend on the same
//! lock. A bucket is created full on first sight of an actor.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: DashMap<u64, Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity as f64,
            refill_per_sec: config.refill_per_sec,
            buckets: DashMap::new(),
        }
    }

    pub fn try_admit(&self, actor_id: u64, cost: u32) -> bool {
        self.try_admit_at(actor_id, cost, Instant::now())
    }

    /// Admits when the bucket holds at least `cost` tokens and deducts them.
    /// Nothing is deducted on rejection.
    pub fn try_admit_at(&self, actor_id: u64, cost: u32, now: Instant) -> bool {
        let cost = cost as f64;
        if cost > self.capacity {
            return false;
        }

        let mut bucket = self.buckets.entry(actor_id).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Forgets buckets that have not been touched for `max_idle`. A forgotten
    /// actor starts over with a full bucket.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(max_idle, Instant::now())
    }

    pub fn evict_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < max_idle);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}
