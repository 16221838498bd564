use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Which quantized model the discrepancy of a layer is measured against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    /// Corrections compound: layer N+1 is measured on the model with layers 1..N corrected.
    #[default]
    Sequential,
    /// Every layer is measured on the quantized model as it was before the call.
    Parallel,
}

/// What to do when a layer of the float model has no counterpart in the quantized model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MissingLayerPolicy {
    /// Fail the whole call with a `NotFound` error.
    #[default]
    Abort,
    /// Record the layer as skipped and carry on with the next one.
    Skip,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    pub mode: CorrectionMode,
    /// Number of calibration batches to evaluate per layer, all of them when `None`.
    pub neval_batches: Option<usize>,
    pub on_missing_layer: MissingLayerPolicy,
}

impl CorrectionConfig {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn parallel() -> Self {
        Self {
            mode: CorrectionMode::Parallel,
            ..Self::default()
        }
    }

    pub fn with_neval_batches(mut self, neval_batches: Option<usize>) -> Self {
        self.neval_batches = neval_batches;
        self
    }

    pub fn with_missing_layer_policy(mut self, policy: MissingLayerPolicy) -> Self {
        self.on_missing_layer = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() -> serde_json::Result<()> {
        let config: CorrectionConfig = serde_json::from_str(r#"{"mode": "parallel"}"#)?;
        assert_eq!(config, CorrectionConfig::parallel());
        let config: CorrectionConfig =
            serde_json::from_str(r#"{"neval_batches": 2, "on_missing_layer": "skip"}"#)?;
        assert_eq!(config.mode, CorrectionMode::Sequential);
        assert_eq!(config.neval_batches, Some(2));
        assert_eq!(config.on_missing_layer, MissingLayerPolicy::Skip);
        Ok(())
    }
}
