use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{errors::Error, Result};

/// Port for the shared remote cache tier.
///
/// A Redis adapter is the intended first implementation; the wire protocol
/// lives outside this crate. Implementations report connection-level
/// failures as [`Error::RemoteTierUnavailable`]; a logical miss is
/// `Ok(None)`.
#[async_trait]
pub trait RemoteTier: Send + Sync {
    async fn get(&self, category: &str, key: &str) -> Result<Option<Value>>;
    async fn set(&self, category: &str, key: &str, value: &Value, ttl: Duration) -> Result<()>;
    async fn remove(&self, category: &str, key: &str) -> Result<()>;
    async fn remove_category(&self, category: &str) -> Result<()>;
}

struct StoredValue {
    raw: String,
    expires_at: Instant,
}

/// In-process implementation of the remote tier port.
///
/// Values are stored serialized and re-parsed on read, so the two tiers never
/// share a value by reference. Doubles as the reference implementation for
/// real adapters and as the test stand-in.
#[derive(Default)]
pub struct InMemoryRemoteTier {
    entries: Mutex<HashMap<(String, String), StoredValue>>,
}

impl InMemoryRemoteTier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RemoteTier for InMemoryRemoteTier {
    async fn get(&self, category: &str, key: &str) -> Result<Option<Value>> {
        let mut entries = self.entries.lock().await;
        let map_key = (category.to_string(), key.to_string());
        let Some(stored) = entries.get(&map_key) else {
            return Ok(None);
        };
        if Instant::now() >= stored.expires_at {
            entries.remove(&map_key);
            return Ok(None);
        }
        match serde_json::from_str(&stored.raw) {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                // Corrupt payloads count as a miss, not a caller error.
                entries.remove(&map_key);
                Ok(None)
            }
        }
    }

    async fn set(&self, category: &str, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| Error::RemoteTierUnavailable(format!("serialize: {e}")))?;
        self.entries.lock().await.insert(
            (category.to_string(), key.to_string()),
            StoredValue {
                raw,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, category: &str, key: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .remove(&(category.to_string(), key.to_string()));
        Ok(())
    }

    async fn remove_category(&self, category: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .retain(|(c, _), _| c != category);
        Ok(())
    }
}

struct DegradedState {
    degraded: bool,
    last_attempt: Option<Instant>,
}

/// Degradation-aware front onto an optional remote tier.
///
/// Connection failures flip the handle into degraded mode: logged once per
/// episode, remote calls suppressed until `probe_interval` has passed, then a
/// single probe is allowed through. The caller never sees
/// [`Error::RemoteTierUnavailable`] — a failing remote tier just behaves like
/// a miss.
pub struct RemoteHandle {
    tier: Option<Arc<dyn RemoteTier>>,
    probe_interval: Duration,
    state: Mutex<DegradedState>,
}

impl RemoteHandle {
    pub fn new(tier: Option<Arc<dyn RemoteTier>>, probe_interval: Duration) -> Self {
        Self {
            tier,
            probe_interval,
            state: Mutex::new(DegradedState {
                degraded: false,
                last_attempt: None,
            }),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.tier.is_some()
    }

    pub async fn is_degraded(&self) -> bool {
        self.state.lock().await.degraded
    }

    pub async fn get(&self, category: &str, key: &str) -> Option<Value> {
        let tier = self.tier.as_ref()?;
        if !self.allow_call().await {
            return None;
        }
        match tier.get(category, key).await {
            Ok(found) => {
                self.note_success().await;
                found
            }
            Err(e) => {
                self.note_failure(&e).await;
                None
            }
        }
    }

    pub async fn set(&self, category: &str, key: &str, value: &Value, ttl: Duration) {
        let Some(tier) = self.tier.as_ref() else {
            return;
        };
        if !self.allow_call().await {
            return;
        }
        match tier.set(category, key, value, ttl).await {
            Ok(()) => self.note_success().await,
            Err(e) => self.note_failure(&e).await,
        }
    }

    pub async fn remove(&self, category: &str, key: &str) {
        let Some(tier) = self.tier.as_ref() else {
            return;
        };
        if !self.allow_call().await {
            return;
        }
        match tier.remove(category, key).await {
            Ok(()) => self.note_success().await,
            Err(e) => self.note_failure(&e).await,
        }
    }

    pub async fn remove_category(&self, category: &str) {
        let Some(tier) = self.tier.as_ref() else {
            return;
        };
        if !self.allow_call().await {
            return;
        }
        match tier.remove_category(category).await {
            Ok(()) => self.note_success().await,
            Err(e) => self.note_failure(&e).await,
        }
    }

    /// In degraded mode only one probe call per `probe_interval` goes
    /// through; everything else is suppressed so a dead remote tier cannot
    /// turn every cache read into a connection attempt.
    async fn allow_call(&self) -> bool {
        let mut st = self.state.lock().await;
        if !st.degraded {
            return true;
        }
        match st.last_attempt {
            Some(t) if t.elapsed() < self.probe_interval => false,
            _ => {
                st.last_attempt = Some(Instant::now());
                true
            }
        }
    }

    async fn note_success(&self) {
        let mut st = self.state.lock().await;
        if st.degraded {
            st.degraded = false;
            st.last_attempt = None;
            println!("[CACHE] remote tier recovered");
        }
    }

    async fn note_failure(&self, e: &Error) {
        let mut st = self.state.lock().await;
        st.last_attempt = Some(Instant::now());
        if !st.degraded {
            st.degraded = true;
            eprintln!("[CACHE] remote tier unavailable, serving from local tier only: {e}");
        }
    }
}
