//! Bias correction for post-training quantized models.
//!
//! Quantizing the weights of a layer shifts the expected value of its output. Given a float
//! model, its quantized counterpart with the same structure and a few calibration batches,
//! [`bias_correction`] measures that shift per output channel on every dense and convolution
//! layer and folds it back into the layer's bias.
//!
//! ```no_run
//! use biascorr::{CorrectionConfig, QuantizationConfig, bias_correction, quantize_model, testing};
//!
//! # fn main() -> biascorr::Result<()> {
//! let mut rng = testing::seeded_rng(0);
//! let float_model = testing::linear_chain(&mut rng, &[3, 4, 5, 6])?;
//! let data = testing::calibration_set(&mut rng, 5, &[10, 3]);
//! let mut quant_model = quantize_model(&float_model, &data, &QuantizationConfig::default())?;
//! let config = CorrectionConfig::default();
//! let report = bias_correction(&float_model, &mut quant_model, &data, &config)?;
//! assert_eq!(report.corrected.len(), 3);
//! # Ok(())
//! # }
//! ```

pub mod correction;
pub mod error;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod quantization;
pub mod tensor;
pub mod testing;

pub use correction::{
    CorrectionConfig, CorrectionMode, CorrectionReport, MissingLayerPolicy, bias_correction,
    parallel_bias_correction, sequential_bias_correction,
};
pub use error::{Error, Result};
pub use layers::{Layer, LayerKind, Param, SupportedLayer, Value};
pub use model::{Model, get_module, get_param};
pub use quantization::{QuantizationConfig, ScalingFactor, quantize_model};
pub use tensor::Tensor;

/// Integer type holding quantized values.
pub type Element = i128;
