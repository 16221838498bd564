//! Bias correction of a quantized model against its float reference.
//!
//! For every quantizable layer of the float model, in traversal order, the calibration inputs
//! are run through both models while the outputs of the layer are captured. The mean per
//! channel difference between the float and quantized outputs is added to the bias of the
//! quantized layer, cancelling the systematic shift quantization introduced.

pub mod config;
pub mod estimator;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{Error, Result},
    layers::{SupportedLayer, Value},
    model::{Hooks, Model},
    tensor::Tensor,
};
pub use config::{CorrectionConfig, CorrectionMode, MissingLayerPolicy};
pub use estimator::estimate;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LayerCorrection {
    pub path: String,
    pub kind: SupportedLayer,
    /// Delta added to the bias, one entry per output channel.
    pub delta: Vec<f32>,
    /// Number of calibration batches the delta was estimated on.
    pub batches: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// The quantized layer has no bias to correct.
    NoBias,
    /// No layer at that path in the quantized model.
    MissingLayer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedLayer {
    pub path: String,
    pub reason: SkipReason,
}

/// What a bias correction call did, in traversal order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CorrectionReport {
    pub corrected: Vec<LayerCorrection>,
    pub skipped: Vec<SkippedLayer>,
}

impl CorrectionReport {
    pub fn delta(&self, path: &str) -> Option<&[f32]> {
        self.corrected
            .iter()
            .find(|c| c.path == path)
            .map(|c| c.delta.as_slice())
    }

    pub fn corrected_paths(&self) -> Vec<&str> {
        self.corrected.iter().map(|c| c.path.as_str()).collect()
    }

    pub fn is_skipped(&self, path: &str) -> bool {
        self.skipped.iter().any(|s| s.path == path)
    }
}

enum Outcome {
    Corrected(LayerCorrection),
    Skipped(SkippedLayer),
}

/// Corrects the biases of `quant_model` in place so that, on the calibration inputs, the mean
/// output of every quantizable layer matches the one of `float_model`.
///
/// Labels of the calibration pairs are ignored. Errors abort the call, layers corrected before
/// the error keep their correction.
pub fn bias_correction<L>(
    float_model: &Model,
    quant_model: &mut Model,
    calibration: &[(Tensor<f32>, L)],
    config: &CorrectionConfig,
) -> Result<CorrectionReport> {
    let batches = evaluation_batches(calibration, config.neval_batches)?;
    // parallel mode measures every layer on the model as it was before any correction
    let baseline = match config.mode {
        CorrectionMode::Sequential => None,
        CorrectionMode::Parallel => Some(quant_model.clone()),
    };

    let mut report = CorrectionReport::default();
    for (path, layer) in float_model.named_layers() {
        let Some(kind) = layer.supported() else {
            continue;
        };
        match correct_layer(
            float_model,
            quant_model,
            baseline.as_ref(),
            &path,
            kind,
            batches,
            config.on_missing_layer,
        )? {
            Outcome::Corrected(correction) => report.corrected.push(correction),
            Outcome::Skipped(skipped) => report.skipped.push(skipped),
        }
    }
    info!(
        mode = ?config.mode,
        batches = batches.len(),
        corrected = report.corrected.len(),
        skipped = report.skipped.len(),
        "bias correction done"
    );
    Ok(report)
}

/// Sequential bias correction: each layer is measured on the model with all previous layers
/// already corrected.
pub fn sequential_bias_correction<L>(
    float_model: &Model,
    quant_model: &mut Model,
    calibration: &[(Tensor<f32>, L)],
    neval_batches: Option<usize>,
) -> Result<CorrectionReport> {
    let config = CorrectionConfig::sequential().with_neval_batches(neval_batches);
    bias_correction(float_model, quant_model, calibration, &config)
}

/// Parallel bias correction: every layer is measured on the uncorrected quantized model.
pub fn parallel_bias_correction<L>(
    float_model: &Model,
    quant_model: &mut Model,
    calibration: &[(Tensor<f32>, L)],
    neval_batches: Option<usize>,
) -> Result<CorrectionReport> {
    let config = CorrectionConfig::parallel().with_neval_batches(neval_batches);
    bias_correction(float_model, quant_model, calibration, &config)
}

fn evaluation_batches<L>(
    calibration: &[(Tensor<f32>, L)],
    neval_batches: Option<usize>,
) -> Result<&[(Tensor<f32>, L)]> {
    if calibration.is_empty() {
        return Err(Error::ParameterError(
            "bias correction needs at least one calibration batch".to_string(),
        ));
    }
    match neval_batches {
        Some(0) => Err(Error::ParameterError(
            "neval_batches must be at least 1".to_string(),
        )),
        Some(n) => Ok(&calibration[..n.min(calibration.len())]),
        None => Ok(calibration),
    }
}

#[instrument(skip_all, fields(path = %path, kind = ?kind))]
fn correct_layer<L>(
    float_model: &Model,
    quant_model: &mut Model,
    baseline: Option<&Model>,
    path: &str,
    kind: SupportedLayer,
    batches: &[(Tensor<f32>, L)],
    on_missing_layer: MissingLayerPolicy,
) -> Result<Outcome> {
    let quant_layer = match quant_model.get_module(path) {
        Ok(layer) => layer,
        Err(Error::NotFound(msg)) if on_missing_layer == MissingLayerPolicy::Skip => {
            warn!(%msg, "no quantized counterpart, skipping layer");
            return Ok(Outcome::Skipped(SkippedLayer {
                path: path.to_string(),
                reason: SkipReason::MissingLayer,
            }));
        }
        Err(e) => return Err(e),
    };
    if quant_layer.supported() != Some(kind) {
        return Err(Error::ShapeMismatch(format!(
            "layer {path:?} is a {kind:?} in the float model but a {:?} in the quantized model",
            quant_layer.kind()
        )));
    }
    if !kind.has_bias(quant_layer)? {
        debug!("layer has no bias, skipping");
        return Ok(Outcome::Skipped(SkippedLayer {
            path: path.to_string(),
            reason: SkipReason::NoBias,
        }));
    }

    let float_outputs = capture(float_model, path, batches)?;
    let quant_outputs = capture(baseline.unwrap_or(&*quant_model), path, batches)?;
    let delta = estimate(&float_outputs, &quant_outputs, kind.channel_axis())?;

    kind.apply_bias_delta(quant_model.get_module_mut(path)?, &delta)?;
    let norm = delta.iter().map(|d| (*d as f64).powi(2)).sum::<f64>().sqrt();
    info!(delta_norm = norm, channels = delta.len(), "bias corrected");
    Ok(Outcome::Corrected(LayerCorrection {
        path: path.to_string(),
        kind,
        delta,
        batches: batches.len(),
    }))
}

/// Runs every batch through `model`, returning the outputs of the layer at `path`.
fn capture<L>(model: &Model, path: &str, batches: &[(Tensor<f32>, L)]) -> Result<Vec<Value>> {
    let mut hooks = Hooks::new();
    let handle = hooks.attach(path);
    for (input, _) in batches {
        model.forward_with(input, Some(&mut hooks))?;
    }
    hooks
        .detach(handle)
        .ok_or_else(|| Error::NotFound(format!("no outputs captured for layer {path:?}")))
}
