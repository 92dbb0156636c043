//! Runtime configuration.
//!
//! Resolved once from the environment and cached for the life of the process:
//! - `PORTATHREAD_STACK_SIZE`: default native stack size for spawned threads,
//!   in bytes, with optional `k`/`m` suffix. Defaults to 2 MiB.
//! - `PORTATHREAD_PRIORITY`: `apply` (default) honors spawn-time priority
//!   requests; `ignore` leaves every thread at the OS default.

use std::sync::OnceLock;

/// Default thread stack size: 2 MiB.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Smallest stack size accepted from the environment.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Whether spawn-time priority requests reach the OS.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriorityPolicy {
    /// Apply the requested priority after the thread starts.
    #[default]
    Apply,
    /// Leave spawned threads at the default priority.
    Ignore,
}

impl PriorityPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" | "off" | "none" | "disabled" => Self::Ignore,
            _ => Self::Apply,
        }
    }

    /// Returns true if spawn-time priorities are applied.
    #[must_use]
    pub const fn applies(self) -> bool {
        matches!(self, Self::Apply)
    }
}

/// Parse a stack size such as `524288`, `512k` or `8M`.
///
/// Returns `None` for malformed values and for sizes below [`MIN_STACK_SIZE`].
#[must_use]
pub fn parse_stack_size(raw: &str) -> Option<usize> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(d) = raw.strip_suffix('k') {
        (d, 1024)
    } else if let Some(d) = raw.strip_suffix('m') {
        (d, 1024 * 1024)
    } else {
        (raw.as_str(), 1)
    };
    let size = digits.trim().parse::<usize>().ok()?.checked_mul(scale)?;
    (size >= MIN_STACK_SIZE).then_some(size)
}

/// Process-wide runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Native stack size for threads spawned without an explicit size.
    pub stack_size: usize,
    /// Spawn-time priority policy.
    pub priority_policy: PriorityPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            priority_policy: PriorityPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from an environment lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let stack_size = match lookup("PORTATHREAD_STACK_SIZE") {
            Some(raw) => parse_stack_size(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "ignoring malformed PORTATHREAD_STACK_SIZE");
                defaults.stack_size
            }),
            None => defaults.stack_size,
        };
        let priority_policy = lookup("PORTATHREAD_PRIORITY")
            .map(|v| PriorityPolicy::from_str_loose(&v))
            .unwrap_or_default();
        Self {
            stack_size,
            priority_policy,
        }
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Get the runtime configuration (reads the environment on first call).
pub fn runtime_config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(|| {
        let config = RuntimeConfig::from_lookup(|name| std::env::var(name).ok());
        tracing::debug!(
            stack_size = config.stack_size,
            priority_policy = ?config.priority_policy,
            "resolved runtime configuration"
        );
        config
    })
}
