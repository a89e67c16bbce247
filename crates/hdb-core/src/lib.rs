//! Caching + resilience core for the HN Discord bot (Rust port).
//!
//! This crate protects the slow, rate-limited backend data store behind a
//! two-tier TTL cache, a sliding-window rate limiter, and a circuit breaker,
//! with background maintenance tasks on top. The Discord surface, the news
//! scraper, and the backend transport live behind ports (traits) implemented
//! in adapter crates.

pub mod circuit;
pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod rate_limit;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod tier;
pub mod ttl;

pub use errors::{Error, Result};
