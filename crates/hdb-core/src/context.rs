use std::sync::Arc;

use crate::{
    circuit::BreakerSet,
    config::Config,
    rate_limit::SlidingWindowLimiter,
    scheduler::{MaintenanceScheduler, PreloadEntry},
    stats::{CacheStats, StatsSink, StatsSnapshot},
    store::CacheStore,
    tier::{RemoteHandle, RemoteTier},
    Result,
};

/// Per-process wiring of the resilience layer.
///
/// Built once at startup and handed to every caller; there are no
/// module-level singletons. The remote tier adapter (if any) is injected by
/// the startup code — `Config::remote_cache_url` only tells that code which
/// target to connect to.
pub struct AppContext {
    cfg: Arc<Config>,
    limiter: Arc<SlidingWindowLimiter>,
    breakers: Arc<BreakerSet>,
    store: Arc<CacheStore>,
    scheduler: MaintenanceScheduler,
}

impl AppContext {
    pub fn new(cfg: Config, remote: Option<Arc<dyn RemoteTier>>) -> Result<Self> {
        Self::with_stats_sink(cfg, remote, None)
    }

    pub fn with_stats_sink(
        cfg: Config,
        remote: Option<Arc<dyn RemoteTier>>,
        sink: Option<Arc<dyn StatsSink>>,
    ) -> Result<Self> {
        cfg.validate()?;

        let cfg = Arc::new(cfg);
        let limiter = Arc::new(SlidingWindowLimiter::new(&cfg));
        let breakers = Arc::new(BreakerSet::new(&cfg));
        let stats = Arc::new(CacheStats::default());
        let remote = Arc::new(RemoteHandle::new(remote, cfg.remote_probe_interval));
        let store = Arc::new(CacheStore::new(
            &cfg,
            Arc::clone(&limiter),
            Arc::clone(&breakers),
            remote,
            stats,
        ));
        let scheduler = MaintenanceScheduler::new(&cfg, Arc::clone(&store), sink);

        Ok(Self {
            cfg,
            limiter,
            breakers,
            store,
            scheduler,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<BreakerSet> {
        &self.breakers
    }

    /// Start maintenance tasks and the startup preload.
    pub async fn start_maintenance(&self, preload: Vec<PreloadEntry>) {
        self.scheduler.start(preload).await;
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }

    // Operational commands (stats dashboard, force refresh) go through these
    // instead of reaching into the store.

    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        self.store.stats_snapshot().await
    }

    pub async fn reset_stats(&self) {
        self.store.reset_stats().await;
    }

    pub async fn invalidate(&self, category: &str, key: &str) {
        self.store.invalidate(category, key).await;
    }

    pub async fn invalidate_category(&self, category: &str) {
        self.store.invalidate_category(category).await;
    }
}
