//! Module that takes care of (de)quantizing tensors
//!
//! Quantization is affine: `q = round(r / S) + z`, clamped to the quantized domain, and
//! `r = (q - z) * S` on the way back. Spans built from an absolute maximum are symmetric,
//! so their zero point is 0.
mod pipeline;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::debug;

use crate::{Element, tensor::Tensor};
pub use pipeline::{QuantizationConfig, quantize_model};

// Get BIT_LEN from environment variable or use default value
pub static BIT_LEN: Lazy<usize> = Lazy::new(|| {
    env::var("BIASCORR_BIT_LEN")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .filter(|bits| (2..=16).contains(bits))
        .unwrap_or(8) // Default value if env var is not set or invalid
});

/// symmetric quantization range used for weights and activations
pub static MIN: Lazy<Element> = Lazy::new(|| -(1 << (*BIT_LEN - 1)) + 1);
pub static MAX: Lazy<Element> = Lazy::new(|| (1 << (*BIT_LEN - 1)) - 1);

/// Biases are stored on 32 bits, at the scale of the accumulator
pub const BIAS_BIT_LEN: usize = 32;
pub const BIAS_DOMAIN: (Element, Element) =
    (-(1 << (BIAS_BIT_LEN - 1)) + 1, (1 << (BIAS_BIT_LEN - 1)) - 1);

/// Maps the float span `[min; max]` onto the integer domain `quantized_domain`.
/// S = (max - min) / (q_max - q_min)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingFactor {
    min: f32,
    max: f32,
    quantized_domain: (Element, Element),
}

impl ScalingFactor {
    pub fn from_absolute_max(abs_max: f32, quantized_domain: Option<(Element, Element)>) -> Self {
        Self::from_span(-(abs_max.abs()), abs_max.abs(), quantized_domain)
    }

    /// Symmetric scaling over the absolute maximum of `t`.
    pub fn from_tensor(t: &Tensor<f32>, quantized_domain: Option<(Element, Element)>) -> Self {
        let max_abs = t.get_data().iter().fold(0.0f32, |a, b| a.max(b.abs()));
        Self::from_absolute_max(max_abs, quantized_domain)
    }

    /// The span is widened to contain 0 so that zero is always exactly representable.
    /// An empty span (all values equal to zero) is mapped to `[-1; 1]`.
    pub fn from_span(min: f32, max: f32, quantized_domain: Option<(Element, Element)>) -> Self {
        let (min, max) = (min.min(0.0), max.max(0.0));
        let (min, max) = if max > min { (min, max) } else { (-1.0, 1.0) };
        Self {
            min,
            max,
            quantized_domain: quantized_domain.unwrap_or((*MIN, *MAX)),
        }
    }

    // Initialize a scaling factor in such a way that `self.scale()` is equal to the `scale` value
    // provided as input.
    pub fn from_scale(scale: f32, quantized_domain: Option<(Element, Element)>) -> Self {
        let (min_quantized, max_quantized) = quantized_domain.unwrap_or((*MIN, *MAX));
        let max = scale / 2.0 * (max_quantized - min_quantized) as f32;
        Self::from_absolute_max(max, quantized_domain)
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn scale(&self) -> f32 {
        (self.max - self.min) / (self.quantized_domain.1 - self.quantized_domain.0) as f32
    }

    pub fn zero_point(&self) -> Element {
        // symmetric span over a symmetric domain: exact, even for 32 bit domains where the
        // general formula loses precision
        if self.min == -self.max && self.quantized_domain.0 == -self.quantized_domain.1 {
            return 0;
        }
        let zp = (self.quantized_domain.0 as f64 - self.min as f64 / self.scale() as f64).round()
            as Element;
        zp.clamp(self.quantized_domain.0, self.quantized_domain.1)
    }

    /// Take a floating point number and quantize it. Values outside of the span are clamped
    /// to the domain bounds; the second member of the pair tells whether that happened.
    pub fn quantize_checked(&self, value: &f32) -> (Element, bool) {
        // formula is q = round(r/S) + z
        let scaled = (*value / self.scale()).round() as Element + self.zero_point();
        let clamped = scaled.clamp(self.quantized_domain.0, self.quantized_domain.1);
        (clamped, clamped != scaled)
    }

    pub fn quantize(&self, value: &f32) -> Element {
        self.quantize_checked(value).0
    }

    pub fn dequantize(&self, value: &Element) -> f32 {
        (*value - self.zero_point()) as f32 * self.scale()
    }
}

impl Default for ScalingFactor {
    fn default() -> Self {
        Self {
            min: -1.0,
            max: 1.0,
            quantized_domain: (*MIN, *MAX),
        }
    }
}

/// A tensor stored as integers together with the parameters needed to recover floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QTensor {
    values: Tensor<Element>,
    scaling: ScalingFactor,
}

impl QTensor {
    pub fn quantize(tensor: &Tensor<f32>, scaling: ScalingFactor) -> Self {
        let mut clamped = 0usize;
        let values = tensor.map(|v| {
            let (q, was_clamped) = scaling.quantize_checked(v);
            clamped += was_clamped as usize;
            q
        });
        if clamped > 0 {
            debug!(
                clamped,
                total = tensor.numel(),
                min = scaling.min(),
                max = scaling.max(),
                "values clamped during quantization"
            );
        }
        Self { values, scaling }
    }

    pub(crate) fn from_parts(values: Tensor<Element>, scaling: ScalingFactor) -> Self {
        Self { values, scaling }
    }

    /// Quantizes the tensor over its own absolute maximum.
    pub fn quantize_per_tensor(
        tensor: &Tensor<f32>,
        quantized_domain: Option<(Element, Element)>,
    ) -> Self {
        Self::quantize(tensor, ScalingFactor::from_tensor(tensor, quantized_domain))
    }

    pub fn dequantize(&self) -> Tensor<f32> {
        self.values.map(|q| self.scaling.dequantize(q))
    }

    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    pub fn values(&self) -> &Tensor<Element> {
        &self.values
    }

    pub fn scaling(&self) -> &ScalingFactor {
        &self.scaling
    }
}
