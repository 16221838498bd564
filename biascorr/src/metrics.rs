//! Signal to quantization noise ratio, used to compare a model to its float reference.

use crate::{
    error::{Error, Result},
    layers::Value,
    model::{Model, get_param},
    tensor::Tensor,
};

/// SQNR in dB of `noisy` against the reference `signal`: `20 * log10(||x|| / ||x - y||)`.
/// Identical tensors give `+inf`, a zero signal with some noise gives `-inf`.
pub fn sqnr(signal: &Tensor<f32>, noisy: &Tensor<f32>) -> Result<f64> {
    if signal.shape() != noisy.shape() {
        return Err(Error::ShapeMismatch(format!(
            "cannot compare tensors of shape {:?} and {:?}",
            signal.shape(),
            noisy.shape()
        )));
    }
    let signal_norm = signal.norm();
    let noise_norm = signal
        .get_data()
        .iter()
        .zip(noisy.get_data())
        .map(|(x, y)| (*x as f64 - *y as f64).powi(2))
        .sum::<f64>()
        .sqrt();
    if noise_norm == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(20.0 * (signal_norm / noise_norm).log10())
}

/// SQNR between two parameters, dequantizing either side when needed.
pub fn param_sqnr(signal: &Value, noisy: &Value) -> Result<f64> {
    sqnr(&signal.dequantize(), &noisy.dequantize())
}

/// SQNR of the parameter `name` of the layer at `path`, between the float model and another
/// model with the same structure.
pub fn layer_sqnr(float_model: &Model, other: &Model, path: &str, name: &str) -> Result<f64> {
    let reference = get_param(float_model.get_module(path)?, name)?;
    let noisy = get_param(other.get_module(path)?, name)?;
    param_sqnr(reference, noisy)
}

/// SQNR of the final outputs of two models over a set of inputs, all outputs concatenated.
pub fn output_sqnr<L>(
    float_model: &Model,
    other: &Model,
    inputs: &[(Tensor<f32>, L)],
) -> Result<f64> {
    let (mut signal, mut noisy) = (Vec::new(), Vec::new());
    for (input, _) in inputs {
        let reference = float_model.forward(input)?.into_float();
        let output = other.forward(input)?.into_float();
        if reference.shape() != output.shape() {
            return Err(Error::ShapeMismatch(format!(
                "model outputs differ in shape: {:?} vs {:?}",
                reference.shape(),
                output.shape()
            )));
        }
        signal.extend(reference.into_data());
        noisy.extend(output.into_data());
    }
    let shape = vec![signal.len()];
    sqnr(&Tensor::new(shape.clone(), signal), &Tensor::new(shape, noisy))
}
