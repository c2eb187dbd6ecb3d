//! Runtime knobs for the apply/read fan-out.
//!
//! Defaults are compiled in and can be overridden through `HOLO_TXN_*`
//! environment variables, mirroring how the WAL picks up its batching knobs.

use std::sync::Arc;
use std::{env, str::FromStr};

use crate::store::DataStore;

/// Default max number of per-key writes in flight during one apply.
const APPLY_CONCURRENCY: usize = 16;
/// Default max number of named reads in flight during one read.
const READ_CONCURRENCY: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub apply_concurrency: usize,
    pub read_concurrency: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            apply_concurrency: APPLY_CONCURRENCY,
            read_concurrency: READ_CONCURRENCY,
        }
    }
}

impl CodecConfig {
    /// Build a config from defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self {
            apply_concurrency: read_env_usize("HOLO_TXN_APPLY_CONCURRENCY", APPLY_CONCURRENCY)
                .max(1),
            read_concurrency: read_env_usize("HOLO_TXN_READ_CONCURRENCY", READ_CONCURRENCY)
                .max(1),
        }
    }
}

/// Caller-supplied execution context: where reads and writes go, and how
/// wide they may fan out.
#[derive(Clone)]
pub struct ExecutionContext {
    store: Arc<dyn DataStore>,
    config: CodecConfig,
}

impl ExecutionContext {
    pub fn new(store: Arc<dyn DataStore>, config: CodecConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &dyn DataStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Read an env var as usize with a default.
fn read_env_usize(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(raw) => usize::from_str(raw.trim()).unwrap_or_else(|err| {
            tracing::warn!(error = ?err, value = %raw, "ignoring {name}");
            default
        }),
        Err(_) => default,
    }
}
