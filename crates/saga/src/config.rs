//! Engine configuration loaded from environment variables.

use saga_store::StoreConfig;

use crate::coordinator::CompensationConfig;

/// Engine settings with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_APPLICATION_ID` — stamped on every outgoing message and step
///   record (default: unset)
/// - `SAGA_ORCHESTRATOR_HOPS` — response-relay steps skipped when resolving
///   a parent for compensation (default: `1`)
/// - the `SAGA_STORE_*` variables of [`StoreConfig::from_env`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub application_id: Option<String>,
    pub orchestrator_hops: usize,
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            application_id: std::env::var("SAGA_APPLICATION_ID")
                .ok()
                .filter(|id| !id.is_empty()),
            orchestrator_hops: std::env::var("SAGA_ORCHESTRATOR_HOPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.orchestrator_hops),
            store: StoreConfig::from_env(),
        }
    }

    pub fn compensation(&self) -> CompensationConfig {
        CompensationConfig {
            orchestrator_hops: self.orchestrator_hops,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application_id: None,
            orchestrator_hops: CompensationConfig::default().orchestrator_hops,
            store: StoreConfig::default(),
        }
    }
}
