use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use crate::{errors::Error, Result};

/// Operation class used when a category does not name its own.
pub const DEFAULT_RATE_CLASS: &str = "backend";

/// Per-category cache settings: how long a value stays fresh, and which
/// rate-limiter/breaker operation class guards its backend loads.
#[derive(Clone, Debug)]
pub struct CategoryConfig {
    pub ttl: Duration,
    pub rate_class: String,
}

impl CategoryConfig {
    fn backend(ttl: Duration) -> Self {
        Self {
            ttl,
            rate_class: DEFAULT_RATE_CLASS.to_string(),
        }
    }
}

/// Sliding-window parameters for one operation class.
#[derive(Clone, Copy, Debug)]
pub struct RateClassConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub safety_margin: Duration,
}

/// Typed configuration for the caching/resilience core.
///
/// Loaded once at process start; the TTL table and rate classes are read-only
/// afterwards. Changing them means restarting, not a live API.
#[derive(Clone, Debug)]
pub struct Config {
    // Cache categories
    pub categories: HashMap<String, CategoryConfig>,

    // Rate limiting
    pub rate_classes: HashMap<String, RateClassConfig>,

    // Circuit breaker
    pub failure_threshold: u32,
    pub open_timeout: Duration,

    // Remote tier (absent = memory-only mode)
    pub remote_cache_url: Option<String>,
    pub remote_probe_interval: Duration,

    // Maintenance
    pub preload_keys: Vec<(String, String)>,
    pub cleanup_interval: Duration,
    pub stats_interval: Duration,

    // Degraded-backend behavior
    pub serve_stale_when_open: bool,
    pub stale_grace: Duration,

    // Default wait budget for a rate-limiter slot inside `get_or_load`
    pub acquire_deadline: Duration,
}

impl Config {
    /// Built-in table. Category TTLs reflect how volatile each kind of
    /// backend data is; `user_subscriptions` changes constantly, the rest is
    /// close to static.
    pub fn defaults() -> Self {
        let mut categories = HashMap::new();
        categories.insert(
            "timezone_names".to_string(),
            CategoryConfig::backend(Duration::from_secs(24 * 3600)),
        );
        categories.insert(
            "extension_info".to_string(),
            CategoryConfig::backend(Duration::from_secs(12 * 3600)),
        );
        categories.insert(
            "function_metadata".to_string(),
            CategoryConfig::backend(Duration::from_secs(12 * 3600)),
        );
        categories.insert(
            "user_subscriptions".to_string(),
            CategoryConfig::backend(Duration::from_secs(300)),
        );

        let mut rate_classes = HashMap::new();
        rate_classes.insert(
            DEFAULT_RATE_CLASS.to_string(),
            RateClassConfig {
                max_requests: 5,
                window: Duration::from_millis(30_000),
                safety_margin: Duration::from_millis(100),
            },
        );

        Self {
            categories,
            rate_classes,
            failure_threshold: 3,
            open_timeout: Duration::from_secs(60),
            remote_cache_url: None,
            remote_probe_interval: Duration::from_secs(30),
            preload_keys: Vec::new(),
            cleanup_interval: Duration::from_secs(600),
            stats_interval: Duration::from_secs(3600),
            serve_stale_when_open: true,
            stale_grace: Duration::from_secs(600),
            acquire_deadline: Duration::from_secs(10),
        }
    }

    /// Load configuration from the environment (with `.env` support) on top
    /// of the built-in defaults, then validate it.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let mut cfg = Self::defaults();

        // TTL overrides: CACHE_TTL_OVERRIDES="user_subscriptions=300,extension_info=43200" (seconds)
        for (category, secs) in parse_csv_kv(env_str("CACHE_TTL_OVERRIDES")) {
            let Some(entry) = cfg.categories.get_mut(&category) else {
                return Err(Error::Config(format!(
                    "CACHE_TTL_OVERRIDES names unknown category: {category}"
                )));
            };
            entry.ttl = Duration::from_secs(secs);
        }

        // Rate limiter (applies to the default operation class)
        if let Some(entry) = cfg.rate_classes.get_mut(DEFAULT_RATE_CLASS) {
            if let Some(v) = env_u32("RATE_LIMIT_MAX_REQUESTS") {
                entry.max_requests = v;
            }
            if let Some(v) = env_u64("RATE_LIMIT_WINDOW_MS") {
                entry.window = Duration::from_millis(v);
            }
            if let Some(v) = env_u64("RATE_LIMIT_SAFETY_MARGIN_MS") {
                entry.safety_margin = Duration::from_millis(v);
            }
        }

        // Circuit breaker
        if let Some(v) = env_u32("CIRCUIT_FAILURE_THRESHOLD") {
            cfg.failure_threshold = v;
        }
        if let Some(v) = env_u64("CIRCUIT_OPEN_TIMEOUT_MS") {
            cfg.open_timeout = Duration::from_millis(v);
        }

        // Remote tier
        cfg.remote_cache_url = env_str("REMOTE_CACHE_URL").and_then(non_empty);
        if let Some(v) = env_u64("REMOTE_PROBE_INTERVAL_MS") {
            cfg.remote_probe_interval = Duration::from_millis(v);
        }

        // Maintenance: PRELOAD_KEYS="timezone_names:all,extension_info:popular"
        cfg.preload_keys = parse_preload_keys(env_str("PRELOAD_KEYS"));
        if let Some(v) = env_u64("CLEANUP_INTERVAL_MS") {
            cfg.cleanup_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("STATS_INTERVAL_MS") {
            cfg.stats_interval = Duration::from_millis(v);
        }

        // Stale serving after a circuit-open rejection
        if let Some(v) = env_bool("SERVE_STALE_WHEN_OPEN") {
            cfg.serve_stale_when_open = v;
        }
        if let Some(v) = env_u64("STALE_GRACE_MS") {
            cfg.stale_grace = Duration::from_millis(v);
        }

        if let Some(v) = env_u64("ACQUIRE_DEADLINE_MS") {
            cfg.acquire_deadline = Duration::from_millis(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup validation: any inconsistency here is fatal rather than a
    /// latent runtime error.
    pub fn validate(&self) -> Result<()> {
        for (name, category) in &self.categories {
            if category.ttl.is_zero() {
                return Err(Error::Config(format!("category {name} has zero TTL")));
            }
            if !self.rate_classes.contains_key(&category.rate_class) {
                return Err(Error::Config(format!(
                    "category {name} references unregistered rate class {}",
                    category.rate_class
                )));
            }
        }

        for (name, class) in &self.rate_classes {
            if class.max_requests == 0 {
                return Err(Error::Config(format!(
                    "rate class {name} has max_requests = 0"
                )));
            }
            if class.window.is_zero() {
                return Err(Error::Config(format!("rate class {name} has zero window")));
            }
        }

        if self.failure_threshold == 0 {
            return Err(Error::Config(
                "CIRCUIT_FAILURE_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.open_timeout.is_zero() {
            return Err(Error::Config(
                "CIRCUIT_OPEN_TIMEOUT_MS must be non-zero".to_string(),
            ));
        }

        for (category, _key) in &self.preload_keys {
            if !self.categories.contains_key(category) {
                return Err(Error::Config(format!(
                    "PRELOAD_KEYS names unknown category: {category}"
                )));
            }
        }

        Ok(())
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn parse_csv_kv(v: Option<String>) -> Vec<(String, u64)> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let key = k.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), v.trim().parse::<u64>().ok()?))
        })
        .collect()
}

fn parse_preload_keys(v: Option<String>) -> Vec<(String, String)> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (category, key) = pair.split_once(':')?;
            let category = category.trim();
            let key = key.trim();
            if category.is_empty() || key.is_empty() {
                return None;
            }
            Some((category.to_string(), key.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::defaults().validate().unwrap();
    }

    #[test]
    fn default_ttl_table() {
        let cfg = Config::defaults();
        assert_eq!(
            cfg.categories["timezone_names"].ttl,
            Duration::from_secs(86_400)
        );
        assert_eq!(
            cfg.categories["user_subscriptions"].ttl,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn unknown_preload_category_is_fatal() {
        let mut cfg = Config::defaults();
        cfg.preload_keys
            .push(("no_such_category".to_string(), "all".to_string()));
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn unregistered_rate_class_is_fatal() {
        let mut cfg = Config::defaults();
        cfg.categories.insert(
            "orphan".to_string(),
            CategoryConfig {
                ttl: Duration::from_secs(60),
                rate_class: "nope".to_string(),
            },
        );
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_max_requests_is_fatal() {
        let mut cfg = Config::defaults();
        if let Some(class) = cfg.rate_classes.get_mut(DEFAULT_RATE_CLASS) {
            class.max_requests = 0;
        }
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn parses_csv_forms() {
        let kv = parse_csv_kv(Some("a=1, b=2 ,bad,=3".to_string()));
        assert_eq!(kv, vec![("a".to_string(), 1), ("b".to_string(), 2)]);

        let keys = parse_preload_keys(Some("timezone_names:all, extension_info:popular".to_string()));
        assert_eq!(
            keys,
            vec![
                ("timezone_names".to_string(), "all".to_string()),
                ("extension_info".to_string(), "popular".to_string()),
            ]
        );
    }
}
