use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::{
    circuit::BreakerSet,
    config::Config,
    errors::Error,
    rate_limit::SlidingWindowLimiter,
    stats::{CacheStats, StatsSnapshot},
    tier::RemoteHandle,
    ttl::TtlRegistry,
    Result,
};

/// One locally cached value. Owned by the local tier; mirrored into the
/// remote tier by copy, never shared by reference.
#[derive(Clone, Debug)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

type CacheKey = (String, String);

/// Shared outcome of one in-flight load. Whichever caller runs the
/// initializer is the flight leader; everyone else awaits and clones the
/// same result.
type Flight = Arc<OnceCell<Result<Value>>>;

/// Two-tier key/value cache with single-flight load deduplication.
///
/// Reads check the local tier, then the shared remote tier; a full miss goes
/// to the backend through the rate limiter and circuit breaker, and the
/// result lands in both tiers under the category's TTL. Local writes are
/// wholesale entry swaps — a concurrent reader sees either the previous
/// completed load or the new one, never a partial write.
pub struct CacheStore {
    ttl: TtlRegistry,
    limiter: Arc<SlidingWindowLimiter>,
    breakers: Arc<BreakerSet>,
    remote: Arc<RemoteHandle>,
    stats: Arc<CacheStats>,
    local: Mutex<HashMap<CacheKey, CacheEntry>>,
    flights: Mutex<HashMap<CacheKey, Flight>>,
    acquire_deadline: Duration,
    stale_grace: Duration,
    serve_stale_when_open: bool,
}

impl CacheStore {
    pub fn new(
        cfg: &Config,
        limiter: Arc<SlidingWindowLimiter>,
        breakers: Arc<BreakerSet>,
        remote: Arc<RemoteHandle>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            ttl: TtlRegistry::new(cfg),
            limiter,
            breakers,
            remote,
            stats,
            local: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            acquire_deadline: cfg.acquire_deadline,
            stale_grace: cfg.stale_grace,
            serve_stale_when_open: cfg.serve_stale_when_open,
        }
    }

    /// Return the cached value for `(category, key)`, loading it from the
    /// backend via `loader` on a miss.
    ///
    /// Concurrent misses for the same key collapse into one backend call; at
    /// most one loader runs per key at a time, and every waiter gets the same
    /// outcome. The loader must be a plain idempotent fetch — it is invoked
    /// behind the rate limiter and circuit breaker and must not cache.
    pub async fn get_or_load<F, Fut>(&self, category: &str, key: &str, loader: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let ttl = self.ttl.ttl_for(category)?;

        if let Some(entry) = self.local_fresh(category, key).await {
            self.stats.record_hit(category).await;
            self.mirror_to_remote(category, key, &entry);
            return Ok(entry.value);
        }

        if let Some(value) = self.remote.get(category, key).await {
            self.stats.record_hit(category).await;
            self.local_put(category, key, value.clone(), ttl).await;
            return Ok(value);
        }

        self.stats.record_miss(category).await;
        self.load_single_flight(category, key, ttl, loader).await
    }

    /// Remove `(category, key)` from both tiers unconditionally.
    pub async fn invalidate(&self, category: &str, key: &str) {
        self.local
            .lock()
            .await
            .remove(&cache_key(category, key));
        self.remote.remove(category, key).await;
    }

    /// Remove every key of `category` from both tiers.
    pub async fn invalidate_category(&self, category: &str) {
        self.local
            .lock()
            .await
            .retain(|(c, _), _| c != category);
        self.remote.remove_category(category).await;
    }

    /// Remove local entries whose expiry has passed.
    ///
    /// Expired keys are collected under one short lock, then removed one at
    /// a time so readers and writers are never blocked for longer than a
    /// single entry removal. Entries still fresh at collection time are
    /// never touched.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<CacheKey> = {
            let local = self.local.lock().await;
            local
                .iter()
                .filter(|(_, entry)| !entry.is_fresh(now))
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut removed = 0;
        for key in expired {
            let mut local = self.local.lock().await;
            if local.get(&key).map(|e| !e.is_fresh(now)).unwrap_or(false) {
                local.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Number of entries currently in the local tier (fresh or not).
    pub async fn local_len(&self) -> usize {
        self.local.lock().await.len()
    }

    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            taken_at: chrono::Local::now().to_rfc3339(),
            categories: self.stats.categories().await,
            circuits: self.breakers.snapshots().await,
            rate_limiter: self.limiter.occupancy().await,
        }
    }

    pub async fn reset_stats(&self) {
        self.stats.reset().await;
    }

    async fn local_fresh(&self, category: &str, key: &str) -> Option<CacheEntry> {
        let local = self.local.lock().await;
        local
            .get(&cache_key(category, key))
            .filter(|entry| entry.is_fresh(Instant::now()))
            .cloned()
    }

    /// Entry usable under the stale grace period after a circuit-open
    /// rejection. Bounded in practice by the cleanup sweep, which removes
    /// expired entries outright.
    async fn local_stale(&self, category: &str, key: &str) -> Option<Value> {
        let local = self.local.lock().await;
        let entry = local.get(&cache_key(category, key))?;
        if Instant::now() < entry.expires_at + self.stale_grace {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    async fn local_put(&self, category: &str, key: &str, value: Value, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.local
            .lock()
            .await
            .insert(cache_key(category, key), entry);
    }

    /// Opportunistic local-hit mirror: best-effort, off the read path,
    /// skipped entirely in memory-only mode. Failures are absorbed by the
    /// degradation layer.
    fn mirror_to_remote(&self, category: &str, key: &str, entry: &CacheEntry) {
        if !self.remote.is_configured() {
            return;
        }
        let remaining = entry.expires_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        let remote = Arc::clone(&self.remote);
        let category = category.to_string();
        let key = key.to_string();
        let value = entry.value.clone();
        tokio::spawn(async move {
            remote.set(&category, &key, &value, remaining).await;
        });
    }

    async fn load_single_flight<F, Fut>(
        &self,
        category: &str,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let fk = cache_key(category, key);
        let flight = {
            let mut flights = self.flights.lock().await;
            Arc::clone(flights.entry(fk.clone()).or_default())
        };

        let outcome = flight
            .get_or_init(|| async { self.load_through_guards(category, key, ttl, loader).await })
            .await
            .clone();

        // Whoever observes completion first clears the registry entry; the
        // ptr_eq guard keeps any newer flight for the same key intact.
        {
            let mut flights = self.flights.lock().await;
            if let Some(current) = flights.get(&fk) {
                if Arc::ptr_eq(current, &flight) {
                    flights.remove(&fk);
                }
            }
        }

        outcome
    }

    async fn load_through_guards<F, Fut>(
        &self,
        category: &str,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let class = self.ttl.rate_class_for(category)?.to_string();
        self.limiter
            .acquire(&class, Some(self.acquire_deadline))
            .await?;

        let breaker = self.breakers.for_class(&class)?;
        match breaker.execute(loader).await {
            Ok(value) => {
                self.local_put(category, key, value.clone(), ttl).await;
                self.remote.set(category, key, &value, ttl).await;
                Ok(value)
            }
            Err(Error::CircuitOpen(class)) => {
                if self.serve_stale_when_open {
                    if let Some(stale) = self.local_stale(category, key).await {
                        println!(
                            "[CACHE] circuit open for {class}, serving stale {category}:{key}"
                        );
                        return Ok(stale);
                    }
                }
                Err(Error::CircuitOpen(class))
            }
            Err(e) => Err(e),
        }
    }
}

fn cache_key(category: &str, key: &str) -> CacheKey {
    (category.to_string(), key.to_string())
}
