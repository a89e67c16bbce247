use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{circuit::CircuitSnapshot, rate_limit::RateOccupancy};

/// Hit/miss counters for one category, cumulative since process start.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CategoryCounters {
    pub hits: u64,
    pub misses: u64,
}

/// Per-category cache counters.
///
/// For every `get_or_load` call exactly one of hit/miss is recorded, so
/// `hits + misses` equals the total number of calls per category. Counters
/// only reset on process restart or an explicit reset command.
#[derive(Default)]
pub struct CacheStats {
    counters: Mutex<HashMap<String, CategoryCounters>>,
}

impl CacheStats {
    pub async fn record_hit(&self, category: &str) {
        let mut counters = self.counters.lock().await;
        counters.entry(category.to_string()).or_default().hits += 1;
    }

    pub async fn record_miss(&self, category: &str) {
        let mut counters = self.counters.lock().await;
        counters.entry(category.to_string()).or_default().misses += 1;
    }

    pub async fn reset(&self) {
        self.counters.lock().await.clear();
    }

    pub async fn categories(&self) -> BTreeMap<String, CategoryCounters> {
        self.counters
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

/// Read-only health snapshot: cache counters plus circuit/limiter state.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub taken_at: String,
    pub categories: BTreeMap<String, CategoryCounters>,
    pub circuits: BTreeMap<String, CircuitSnapshot>,
    pub rate_limiter: BTreeMap<String, RateOccupancy>,
}

/// Port for the external stats collector.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn emit(&self, snapshot: &StatsSnapshot);
}

/// Default sink: one JSON line on stdout.
pub struct LogStatsSink;

#[async_trait]
impl StatsSink for LogStatsSink {
    async fn emit(&self, snapshot: &StatsSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("[MAINT] stats {line}"),
            Err(e) => eprintln!("[MAINT] failed to serialize stats: {e}"),
        }
    }
}
