use std::{collections::HashMap, time::Duration};

use crate::{
    config::{CategoryConfig, Config},
    errors::Error,
    Result,
};

/// Immutable lookup from data category to cache lifetime and operation class.
///
/// Built once from [`Config`]; there is deliberately no default TTL — asking
/// for an unregistered category is a configuration bug and surfaces as
/// [`Error::UnknownCategory`].
pub struct TtlRegistry {
    entries: HashMap<String, CategoryConfig>,
}

impl TtlRegistry {
    pub fn new(cfg: &Config) -> Self {
        Self {
            entries: cfg.categories.clone(),
        }
    }

    pub fn ttl_for(&self, category: &str) -> Result<Duration> {
        self.entries
            .get(category)
            .map(|c| c.ttl)
            .ok_or_else(|| Error::UnknownCategory(category.to_string()))
    }

    pub fn rate_class_for(&self, category: &str) -> Result<&str> {
        self.entries
            .get(category)
            .map(|c| c.rate_class.as_str())
            .ok_or_else(|| Error::UnknownCategory(category.to_string()))
    }

    pub fn contains(&self, category: &str) -> bool {
        self.entries.contains_key(category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_category_resolves() {
        let registry = TtlRegistry::new(&Config::defaults());
        assert_eq!(
            registry.ttl_for("function_metadata").unwrap(),
            Duration::from_secs(12 * 3600)
        );
        assert_eq!(registry.rate_class_for("function_metadata").unwrap(), "backend");
    }

    #[test]
    fn unknown_category_errors() {
        let registry = TtlRegistry::new(&Config::defaults());
        assert!(matches!(
            registry.ttl_for("not_a_category"),
            Err(Error::UnknownCategory(name)) if name == "not_a_category"
        ));
    }
}
