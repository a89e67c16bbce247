//! Background maintenance for the cache store.
//!
//! Three independent activities, each tolerant of being skipped or delayed:
//! - periodic sweep of expired local entries
//! - periodic stats snapshot emitted through the [`StatsSink`] port
//! - one-shot preload of high-value keys at startup

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    stats::{LogStatsSink, StatsSink},
    store::CacheStore,
};

/// Boxed loader future, so preload entries can be built from config.
pub type BoxedLoadFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// One key to warm at startup. The factory produces a fresh loader future
/// per attempt.
pub struct PreloadEntry {
    pub category: String,
    pub key: String,
    pub loader: Arc<dyn Fn() -> BoxedLoadFuture + Send + Sync>,
}

impl PreloadEntry {
    pub fn new<F>(category: impl Into<String>, key: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> BoxedLoadFuture + Send + Sync + 'static,
    {
        Self {
            category: category.into(),
            key: key.into(),
            loader: Arc::new(loader),
        }
    }
}

#[derive(Clone)]
pub struct MaintenanceScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<CacheStore>,
    sink: Arc<dyn StatsSink>,
    cleanup_interval: Duration,
    stats_interval: Duration,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    tasks: Vec<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl MaintenanceScheduler {
    pub fn new(cfg: &Config, store: Arc<CacheStore>, sink: Option<Arc<dyn StatsSink>>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                sink: sink.unwrap_or_else(|| Arc::new(LogStatsSink)),
                cleanup_interval: cfg.cleanup_interval,
                stats_interval: cfg.stats_interval,
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Spawn the periodic tasks and run the startup preload once.
    ///
    /// Calling `start` again first stops any previous tasks, so a restart
    /// never leaks loops.
    pub async fn start(&self, preload: Vec<PreloadEntry>) {
        self.stop().await;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        {
            let scheduler = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                scheduler.cleanup_loop(token).await;
            }));
        }

        {
            let scheduler = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                scheduler.stats_loop(token).await;
            }));
        }

        {
            let scheduler = self.clone();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = scheduler.run_preload(preload) => {}
                }
            }));
        }

        let mut st = self.inner.state.lock().await;
        st.cancel = Some(cancel);
        st.tasks = tasks;
        println!("[MAINT] maintenance tasks started");
    }

    pub async fn stop(&self) {
        let mut st = self.inner.state.lock().await;
        if let Some(token) = st.cancel.take() {
            token.cancel();
        }
        for task in st.tasks.drain(..) {
            task.abort(); // best-effort
        }
    }

    /// Warm the configured keys before normal traffic begins. Failures are
    /// logged and skipped; a cold category just stays cold until its first
    /// real request.
    pub async fn run_preload(&self, entries: Vec<PreloadEntry>) {
        if entries.is_empty() {
            return;
        }
        println!("[MAINT] preloading {} keys", entries.len());
        for entry in entries {
            let loader = Arc::clone(&entry.loader);
            match self
                .inner
                .store
                .get_or_load(&entry.category, &entry.key, move || loader())
                .await
            {
                Ok(_) => println!("[MAINT] preloaded {}:{}", entry.category, entry.key),
                Err(e) => eprintln!(
                    "[MAINT] preload failed for {}:{}: {e}",
                    entry.category, entry.key
                ),
            }
        }
    }

    async fn cleanup_loop(&self, token: CancellationToken) {
        let mut tick = tokio::time::interval(self.inner.cleanup_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    let removed = self.inner.store.sweep_expired().await;
                    if removed > 0 {
                        println!("[MAINT] cleanup removed {removed} expired entries");
                    }
                }
            }
        }
    }

    async fn stats_loop(&self, token: CancellationToken) {
        let mut tick = tokio::time::interval(self.inner.stats_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    let snapshot = self.inner.store.stats_snapshot().await;
                    self.inner.sink.emit(&snapshot).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        circuit::BreakerSet, rate_limit::SlidingWindowLimiter, stats::CacheStats,
        stats::StatsSnapshot, tier::RemoteHandle,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    fn build_store(cfg: &Config) -> Arc<CacheStore> {
        Arc::new(CacheStore::new(
            cfg,
            Arc::new(SlidingWindowLimiter::new(cfg)),
            Arc::new(BreakerSet::new(cfg)),
            Arc::new(RemoteHandle::new(None, cfg.remote_probe_interval)),
            Arc::new(CacheStats::default()),
        ))
    }

    #[derive(Default)]
    struct CapturingSink {
        snapshots: Mutex<Vec<StatsSnapshot>>,
    }

    #[async_trait]
    impl StatsSink for CapturingSink {
        async fn emit(&self, snapshot: &StatsSnapshot) {
            self.snapshots.lock().await.push(snapshot.clone());
        }
    }

    #[tokio::test]
    async fn preload_warms_the_cache() {
        let cfg = Config::defaults();
        let store = build_store(&cfg);
        let scheduler = MaintenanceScheduler::new(&cfg, Arc::clone(&store), None);

        let loads = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&loads);
        let entries = vec![PreloadEntry::new("timezone_names", "all", move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(["UTC", "Europe/Rome"]))
            }) as BoxedLoadFuture
        })];
        scheduler.run_preload(entries).await;

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        // Preloaded: the next read is a hit, no loader involved.
        let value = store
            .get_or_load("timezone_names", "all", || async {
                panic!("already warm")
            })
            .await
            .unwrap();
        assert_eq!(value, json!(["UTC", "Europe/Rome"]));
    }

    #[tokio::test]
    async fn preload_failure_does_not_abort_the_rest() {
        let cfg = Config::defaults();
        let store = build_store(&cfg);
        let scheduler = MaintenanceScheduler::new(&cfg, Arc::clone(&store), None);

        let entries = vec![
            PreloadEntry::new("extension_info", "broken", || {
                Box::pin(async { Err(anyhow::anyhow!("backend down")) }) as BoxedLoadFuture
            }),
            PreloadEntry::new("extension_info", "ok", || {
                Box::pin(async { Ok(json!({"v": 1})) }) as BoxedLoadFuture
            }),
        ];
        scheduler.run_preload(entries).await;

        assert_eq!(store.local_len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_sweeps_on_its_interval() {
        let mut cfg = Config::defaults();
        cfg.cleanup_interval = Duration::from_secs(600);
        let store = build_store(&cfg);
        let scheduler = MaintenanceScheduler::new(&cfg, Arc::clone(&store), None);

        store
            .get_or_load("user_subscriptions", "42", || async { Ok(json!(1)) })
            .await
            .unwrap(); // 5 min TTL
        store
            .get_or_load("timezone_names", "all", || async { Ok(json!(2)) })
            .await
            .unwrap(); // 24 h TTL

        scheduler.start(Vec::new()).await;
        tokio::task::yield_now().await; // let the loops register their timers
        tokio::time::advance(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(store.local_len().await, 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stats_task_emits_snapshots() {
        let mut cfg = Config::defaults();
        cfg.stats_interval = Duration::from_secs(3600);
        cfg.cleanup_interval = Duration::from_secs(86_400);
        let store = build_store(&cfg);
        let sink = Arc::new(CapturingSink::default());
        let scheduler = MaintenanceScheduler::new(
            &cfg,
            Arc::clone(&store),
            Some(sink.clone() as Arc<dyn StatsSink>),
        );

        store
            .get_or_load("extension_info", "pg_trgm", || async { Ok(json!(1)) })
            .await
            .unwrap();

        scheduler.start(Vec::new()).await;
        tokio::task::yield_now().await; // let the loops register their timers
        tokio::time::advance(Duration::from_secs(3601)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let snapshots = sink.snapshots.lock().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].categories["extension_info"].misses, 1);
        drop(snapshots);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let cfg = Config::defaults();
        let store = build_store(&cfg);
        let scheduler = MaintenanceScheduler::new(&cfg, store, None);
        scheduler.start(Vec::new()).await;
        scheduler.stop().await;
        scheduler.stop().await;
    }
}
