use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{config::Config, errors::Error, Result};

/// Operational mode of one breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing fast, calls rejected until the open timeout elapses.
    Open,
    /// One trial call in flight; its outcome decides Closed vs Open.
    HalfOpen,
}

/// Point-in-time breaker health for the stats snapshot.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

enum Admission {
    Allow,
    Trial,
}

/// Failure-isolating state machine wrapping calls to the backend.
///
/// The admission check and the post-call record are each a short critical
/// section; the protected operation itself runs with the lock released, so a
/// slow backend call never stalls other callers' state transitions.
pub struct CircuitBreaker {
    class: String,
    failure_threshold: u32,
    open_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(class: impl Into<String>, failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            class: class.into(),
            failure_threshold,
            open_timeout,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Run `op` under breaker protection.
    ///
    /// Rejected calls fail with [`Error::CircuitOpen`] without invoking `op`.
    /// An operation failure is recorded, then surfaced as [`Error::Backend`].
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let admission = self.admit().await?;

        match op().await {
            Ok(value) => {
                self.record_success(admission).await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(admission).await;
                Err(Error::Backend(format!("{e:#}")))
            }
        }
    }

    async fn admit(&self) -> Result<Admission> {
        let mut st = self.state.lock().await;
        match st.state {
            CircuitState::Closed => Ok(Admission::Allow),
            CircuitState::Open => {
                let cooled_down = st
                    .last_failure
                    .map(|t| t.elapsed() > self.open_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    st.state = CircuitState::HalfOpen;
                    st.trial_in_flight = true;
                    // Also re-arms the trial if this one is abandoned.
                    st.last_failure = Some(Instant::now());
                    println!(
                        "[CIRCUIT] {}: open timeout elapsed, allowing trial call",
                        self.class
                    );
                    Ok(Admission::Trial)
                } else {
                    Err(Error::CircuitOpen(self.class.clone()))
                }
            }
            CircuitState::HalfOpen => {
                let trial_stuck = st
                    .last_failure
                    .map(|t| t.elapsed() > self.open_timeout)
                    .unwrap_or(true);
                if !st.trial_in_flight || trial_stuck {
                    st.trial_in_flight = true;
                    st.last_failure = Some(Instant::now());
                    Ok(Admission::Trial)
                } else {
                    Err(Error::CircuitOpen(self.class.clone()))
                }
            }
        }
    }

    async fn record_success(&self, admission: Admission) {
        let mut st = self.state.lock().await;
        match admission {
            Admission::Allow => {
                st.failure_count = 0;
            }
            Admission::Trial => {
                st.state = CircuitState::Closed;
                st.failure_count = 0;
                st.trial_in_flight = false;
                println!("[CIRCUIT] {}: trial succeeded, closing", self.class);
            }
        }
    }

    async fn record_failure(&self, admission: Admission) {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        match admission {
            Admission::Allow => {
                st.failure_count += 1;
                st.last_failure = Some(now);
                if st.state == CircuitState::Closed && st.failure_count >= self.failure_threshold {
                    st.state = CircuitState::Open;
                    eprintln!(
                        "[CIRCUIT] {}: {} consecutive failures, opening for {:?}",
                        self.class, st.failure_count, self.open_timeout
                    );
                }
            }
            Admission::Trial => {
                st.state = CircuitState::Open;
                st.last_failure = Some(now);
                st.trial_in_flight = false;
                eprintln!("[CIRCUIT] {}: trial failed, re-opening", self.class);
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn snapshot(&self) -> CircuitSnapshot {
        let st = self.state.lock().await;
        CircuitSnapshot {
            state: st.state,
            failure_count: st.failure_count,
        }
    }
}

/// One breaker per operation class, built from config and immutable after.
pub struct BreakerSet {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerSet {
    pub fn new(cfg: &Config) -> Self {
        let breakers = cfg
            .rate_classes
            .keys()
            .map(|class| {
                (
                    class.clone(),
                    Arc::new(CircuitBreaker::new(
                        class.clone(),
                        cfg.failure_threshold,
                        cfg.open_timeout,
                    )),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn for_class(&self, class: &str) -> Result<Arc<CircuitBreaker>> {
        self.breakers
            .get(class)
            .cloned()
            .ok_or_else(|| Error::UnknownCategory(class.to_string()))
    }

    pub async fn snapshots(&self) -> BTreeMap<String, CircuitSnapshot> {
        let mut out = BTreeMap::new();
        for (class, breaker) in &self.breakers {
            out.insert(class.clone(), breaker.snapshot().await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("backend", 3, Duration::from_secs(60))
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .execute(|| async { Err::<(), _>(anyhow::anyhow!("backend down")) })
            .await;
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let b = breaker();
        fail(&b).await;
        fail(&b).await;
        b.execute(|| async { Ok::<_, anyhow::Error>(1u32) })
            .await
            .unwrap();
        assert_eq!(b.snapshot().await.failure_count, 0);
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state().await, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let err = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(1u32)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_success_closes() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }

        tokio::time::advance(Duration::from_secs(61)).await;

        b.execute(|| async { Ok::<_, anyhow::Error>("ok") })
            .await
            .unwrap();
        let snap = b.snapshot().await;
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&b).await;
        assert_eq!(b.state().await, CircuitState::Open);

        // Still rejecting: the re-open refreshed the failure time.
        let err = b
            .execute(|| async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_at_a_time() {
        let b = Arc::new(breaker());
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        // First caller takes the trial slot and holds it.
        let trial = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.execute(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, anyhow::Error>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // A concurrent caller during the trial is rejected.
        let err = b
            .execute(|| async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));

        trial.await.unwrap().unwrap();
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn set_has_one_breaker_per_class() {
        let set = BreakerSet::new(&Config::defaults());
        let a = set.for_class("backend").unwrap();
        let b = set.for_class("backend").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            set.for_class("nope"),
            Err(Error::UnknownCategory(_))
        ));
    }
}
