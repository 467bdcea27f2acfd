use std::{path::Path, time::Duration};

use anyhow::{Context as _, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use super::types::{DNS01, HTTP01, TLS_ALPN01};

pub const DEFAULT_FIELD_MANAGER: &str = "acme-reconciler";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;

/// How the status updater writes changes back to the resource store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    /// Optimistic-concurrency checked replace.
    #[default]
    Update,
    /// Declarative merge owned by the configured field manager.
    Apply,
}

/// Bounded exponential backoff: `initial_ms * 2^attempt`, capped at `max_ms`,
/// for at most `max_attempts` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl BackoffConfig {
    pub const fn new(initial_ms: u64, max_ms: u64, max_attempts: u32) -> Self {
        Self {
            initial_ms,
            max_ms,
            max_attempts,
        }
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("{name}.max_attempts must be greater than zero");
        }
        if self.initial_ms == 0 {
            bail!("{name}.initial_ms must be greater than zero");
        }
        if self.initial_ms > self.max_ms {
            bail!(
                "{name}.initial_ms ({}) exceeds {name}.max_ms ({})",
                self.initial_ms,
                self.max_ms
            );
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(5_000, 300_000, 20)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Challenge types in order of preference; only types with a registered solver are used.
    pub challenge_type_priority: Vec<String>,
    /// Authority polls after a challenge has been accepted.
    pub challenge_backoff: BackoffConfig,
    /// Presentation checks before a challenge is accepted.
    pub presentation_backoff: BackoffConfig,
    /// Order polls after finalization.
    pub order_backoff: BackoffConfig,
    pub persist_mode: PersistMode,
    pub field_manager: String,
    pub http_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            challenge_type_priority: vec![HTTP01.into(), DNS01.into(), TLS_ALPN01.into()],
            challenge_backoff: BackoffConfig::default(),
            presentation_backoff: BackoffConfig::default(),
            order_backoff: BackoffConfig::new(5_000, 300_000, 30),
            persist_mode: PersistMode::Update,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ReconcilerConfig =
            serde_json::from_str(raw).context("failed to parse reconciler config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.challenge_type_priority.is_empty() {
            return Err(anyhow!("challenge_type_priority must not be empty"));
        }
        if self.field_manager.trim().is_empty() {
            return Err(anyhow!("field_manager must not be empty"));
        }
        self.challenge_backoff.validate("challenge_backoff")?;
        self.presentation_backoff.validate("presentation_backoff")?;
        self.order_backoff.validate("order_backoff")?;
        Ok(())
    }

    /// Position of `challenge_type` in the priority list, `None` when unranked.
    pub fn rank(&self, challenge_type: &str) -> Option<usize> {
        self.challenge_type_priority
            .iter()
            .position(|candidate| candidate == challenge_type)
    }

    /// Client timeout for authority and issuer HTTP calls, after the
    /// environment override.
    pub fn http_timeout(&self) -> Duration {
        crate::issuance::http::resolve_timeout(self.http_timeout_secs)
    }
}
