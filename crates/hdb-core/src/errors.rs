/// Core error type for the caching/resilience layer.
///
/// Every caller-visible operation returns one of these so calling code can
/// distinguish "try again later" from "data unavailable" from "must not
/// retry yet". All payloads are `Clone` so a single load outcome can be
/// fanned out to every waiter sharing an in-flight load.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown category or rate class: {0}")]
    UnknownCategory(String),

    #[error("rate limit timeout for class {class} after {waited_ms}ms")]
    RateLimitTimeout { class: String, waited_ms: u64 },

    #[error("circuit open for class {0}")]
    CircuitOpen(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("remote tier unavailable: {0}")]
    RemoteTierUnavailable(String),
}

impl Error {
    /// Whether retrying the same call soon can succeed.
    ///
    /// `CircuitOpen` is deliberately not retryable: the breaker decides when
    /// the backend may be probed again, not the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimitTimeout { .. } | Error::Backend(_) | Error::RemoteTierUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
