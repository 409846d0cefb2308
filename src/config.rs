use std::time::Duration;

use crate::status::{AverageFallback, DEFAULT_APPROVAL_THRESHOLD};
use crate::sync::SyncMode;

pub const DEFAULT_MUTATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub mode: SyncMode,
    pub approval_threshold: f64,
    /// Upper bound on every mutating gateway call.
    pub mutation_timeout: Duration,
    pub average_fallback: AverageFallback,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Polling,
            approval_threshold: DEFAULT_APPROVAL_THRESHOLD,
            mutation_timeout: DEFAULT_MUTATION_TIMEOUT,
            average_fallback: AverageFallback::AllRecords,
        }
    }
}

impl EngineConfig {
    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_mutation_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = timeout;
        self
    }
}
