use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    config::{Config, RateClassConfig},
    errors::Error,
    Result,
};

/// Current window fill for one operation class, for the stats snapshot.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RateOccupancy {
    pub in_window: u32,
    pub max_requests: u32,
}

struct ClassState {
    cfg: RateClassConfig,
    window: Mutex<VecDeque<Instant>>,
}

/// Sliding-window admission control, one window per operation class.
///
/// The window mutation (trim + append) is atomic under the class mutex; the
/// wait for a free slot always happens with the lock released so other
/// callers can keep checking and updating the window.
pub struct SlidingWindowLimiter {
    classes: HashMap<String, ClassState>,
}

impl SlidingWindowLimiter {
    pub fn new(cfg: &Config) -> Self {
        let classes = cfg
            .rate_classes
            .iter()
            .map(|(name, class)| {
                (
                    name.clone(),
                    ClassState {
                        cfg: *class,
                        window: Mutex::new(VecDeque::new()),
                    },
                )
            })
            .collect();
        Self { classes }
    }

    /// Acquire a slot in `class`, waiting if the window is full.
    ///
    /// Grants immediately when the trailing window holds fewer than
    /// `max_requests` timestamps; otherwise sleeps until the oldest entry
    /// leaves the window (plus the safety margin) and re-checks, iteratively.
    /// With `deadline = Some(d)`, fails with [`Error::RateLimitTimeout`] as
    /// soon as the next re-check could not happen before `d` has elapsed;
    /// `None` waits indefinitely.
    pub async fn acquire(&self, class: &str, deadline: Option<Duration>) -> Result<()> {
        let state = self
            .classes
            .get(class)
            .ok_or_else(|| Error::UnknownCategory(class.to_string()))?;

        let started = Instant::now();
        loop {
            let wait = {
                let mut window = state.window.lock().await;
                let now = Instant::now();
                trim_window(&mut window, now, state.cfg.window);

                if (window.len() as u32) < state.cfg.max_requests {
                    window.push_back(now);
                    return Ok(());
                }

                // Full: the oldest timestamp bounds when the next slot frees up.
                let Some(oldest) = window.front().copied() else {
                    continue;
                };
                state
                    .cfg
                    .window
                    .saturating_sub(now.duration_since(oldest))
                    + state.cfg.safety_margin
            };

            if let Some(budget) = deadline {
                if started.elapsed() + wait > budget {
                    return Err(Error::RateLimitTimeout {
                        class: class.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }

            sleep(wait).await;
        }
    }

    /// Trim every window to now and report occupancy per class.
    pub async fn occupancy(&self) -> BTreeMap<String, RateOccupancy> {
        let mut out = BTreeMap::new();
        for (name, state) in &self.classes {
            let mut window = state.window.lock().await;
            trim_window(&mut window, Instant::now(), state.cfg.window);
            out.insert(
                name.clone(),
                RateOccupancy {
                    in_window: window.len() as u32,
                    max_requests: state.cfg.max_requests,
                },
            );
        }
        out
    }
}

fn trim_window(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while window
        .front()
        .map(|t| now.duration_since(*t) >= span)
        .unwrap_or(false)
    {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> SlidingWindowLimiter {
        let mut cfg = Config::defaults();
        cfg.rate_classes.insert(
            "backend".to_string(),
            RateClassConfig {
                max_requests,
                window: Duration::from_millis(window_ms),
                safety_margin: Duration::from_millis(100),
            },
        );
        SlidingWindowLimiter::new(&cfg)
    }

    #[tokio::test(start_paused = true)]
    async fn grants_immediately_under_limit() {
        let limiter = limiter(5, 30_000);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire("backend", None).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_acquire_waits_out_the_window() {
        let limiter = limiter(5, 30_000);
        let start = Instant::now();
        for _ in 0..6 {
            limiter.acquire("backend", None).await.unwrap();
        }
        // The 6th slot opens no earlier than 30s after the 1st timestamp.
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_without_sleeping_it_out() {
        let limiter = limiter(1, 30_000);
        limiter.acquire("backend", None).await.unwrap();

        let start = Instant::now();
        let err = limiter
            .acquire("backend", Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitTimeout { .. }));
        // Failed fast: the needed wait (~30s) already exceeded the 5s budget.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn window_entries_expire() {
        let limiter = limiter(2, 1_000);
        limiter.acquire("backend", None).await.unwrap();
        limiter.acquire("backend", None).await.unwrap();

        tokio::time::advance(Duration::from_millis(1_100)).await;

        let start = Instant::now();
        limiter.acquire("backend", None).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        let occupancy = limiter.occupancy().await;
        assert_eq!(occupancy["backend"].in_window, 1);
        assert_eq!(occupancy["backend"].max_requests, 2);
    }

    #[tokio::test]
    async fn unknown_class_is_rejected() {
        let limiter = limiter(5, 30_000);
        assert!(matches!(
            limiter.acquire("nope", None).await,
            Err(Error::UnknownCategory(_))
        ));
    }
}
