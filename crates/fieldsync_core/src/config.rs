//! Cache and outbox tuning.

use std::collections::HashMap;
use std::time::Duration;

/// Default freshness window for cached entities.
const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Default number of retryable attempts before an operation is abandoned.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Per-kind freshness configuration.
///
/// # Example
///
/// ```rust
/// use fieldsync_core::CachePolicy;
/// use std::time::Duration;
///
/// let policy = CachePolicy::default()
///     .with_kind_ttl("reference_data", Duration::from_secs(24 * 3600))
///     .with_kind_ttl("appointments", Duration::from_secs(60));
///
/// assert_eq!(policy.ttl_for("appointments"), Duration::from_secs(60));
/// assert_eq!(policy.ttl_for("samples"), policy.default_ttl);
/// ```
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// TTL for kinds with no override.
    pub default_ttl: Duration,
    /// Per-kind overrides.
    pub per_kind: HashMap<String, Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            per_kind: HashMap::new(),
        }
    }
}

impl CachePolicy {
    /// Creates a policy with the given default TTL.
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            per_kind: HashMap::new(),
        }
    }

    /// Overrides the TTL of one entity kind.
    #[must_use]
    pub fn with_kind_ttl(mut self, kind: impl Into<String>, ttl: Duration) -> Self {
        self.per_kind.insert(kind.into(), ttl);
        self
    }

    /// Returns the TTL that applies to `kind`.
    #[must_use]
    pub fn ttl_for(&self, kind: &str) -> Duration {
        self.per_kind.get(kind).copied().unwrap_or(self.default_ttl)
    }
}

/// Outbox retry limits.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Retryable failures allowed before an operation becomes `Failed`.
    pub max_attempts: u32,
    /// Merge consecutive writes to the same entity before they are sent.
    pub coalesce: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            coalesce: true,
        }
    }
}

impl OutboxConfig {
    /// Sets the attempt limit. Zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Enables or disables write coalescing.
    #[must_use]
    pub fn with_coalescing(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }
}
