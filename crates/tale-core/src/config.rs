//! Configuration: built-in defaults, then an optional TOML file, then the environment.
//!
//! | Source | Example |
//! |--------|---------|
//! | `TALE_CONFIG` | path to the TOML file (default `config/tale.toml`, skipped if missing) |
//! | `TALE__GUARD__COST_THRESHOLD_USD` | `0.25` |
//! | `TALE__INVOKER__DEFAULT_TIMEOUT_MS` | `15000` |
//! | `TALE__STORE__BACKEND` | `memory` \| `sled` |
//!
//! The provider API key is never read from the file; see `OpenRouterProvider::api_key_from_env`.

use crate::error::{TaleError, TaleResult};
use crate::finops::CostRates;
use crate::guard::GuardConfig;
use crate::invoker::InvokerConfig;
use crate::kv::{KvStore, MemoryKv, SledKv};
use crate::openrouter::ProviderConfig;
use crate::verify::VerificationConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "config/tale.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Sled directory; ignored for `memory`.
    pub path: Option<String>,
}

impl StoreConfig {
    /// Open the configured key-value adapter.
    pub fn open(&self) -> TaleResult<Arc<dyn KvStore>> {
        Ok(match self.backend {
            StoreBackend::Memory => Arc::new(MemoryKv::new()),
            StoreBackend::Sled => Arc::new(SledKv::open(self.path.as_deref())?),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaleConfig {
    pub guard: GuardConfig,
    pub invoker: InvokerConfig,
    pub rates: CostRates,
    pub verification: VerificationConfig,
    pub provider: ProviderConfig,
    pub store: StoreConfig,
}

impl TaleConfig {
    /// Load from `TALE_CONFIG` (or the default path) and `TALE__*` environment variables.
    pub fn load() -> TaleResult<Self> {
        let path = std::env::var("TALE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> TaleResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };
        let built = builder
            .add_source(config::Environment::with_prefix("TALE").separator("__"))
            .build()?;
        let cfg: Self = built.try_deserialize()?;
        cfg.validated()
    }

    fn validated(self) -> TaleResult<Self> {
        if self.guard.failure_threshold == 0 {
            return Err(TaleError::Config("guard.failure_threshold must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.verification.approval_confidence) {
            return Err(TaleError::Config(
                "verification.approval_confidence must be within [0, 1]".into(),
            ));
        }
        if self.rates.input_usd_per_token < 0.0 || self.rates.output_usd_per_token < 0.0 {
            return Err(TaleError::Config("rates must be non-negative".into()));
        }
        Ok(self)
    }

    /// Render as TOML (template for a config file).
    pub fn to_toml(&self) -> TaleResult<String> {
        toml::to_string_pretty(self).map_err(|e| TaleError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = TaleConfig::default();
        assert_eq!(cfg.guard.token_budget_per_session, 50_000);
        assert_eq!(cfg.guard.cost_threshold_usd, 0.50);
        assert_eq!(cfg.guard.failure_threshold, 5);
        assert_eq!(cfg.guard.circuit_reset_ms, 60_000);
        assert_eq!(cfg.invoker.cache_ttl_secs, 1_800);
        assert_eq!(cfg.verification.approval_confidence, 0.8);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[guard]\ncost_threshold_usd = 0.25\n\n[store]\nbackend = \"sled\"").unwrap();
        let cfg = TaleConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.guard.cost_threshold_usd, 0.25);
        assert_eq!(cfg.guard.failure_threshold, 5);
        assert_eq!(cfg.store.backend, StoreBackend::Sled);
    }

    #[test]
    fn rejects_zero_failure_threshold() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[guard]\nfailure_threshold = 0").unwrap();
        assert!(matches!(
            TaleConfig::load_from(file.path()),
            Err(TaleError::Config(_))
        ));
    }

    #[test]
    fn renders_toml_template() {
        let text = TaleConfig::default().to_toml().unwrap();
        assert!(text.contains("[guard]"));
        assert!(text.contains("token_budget_per_session = 50000"));
    }
}
