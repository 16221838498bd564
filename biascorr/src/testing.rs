//! Seeded builders for the models and data used by tests, benches and the command line.

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    error::Result,
    layers::{Convolution, DeQuantStub, Dense, QuantStub, Sequential},
    model::{Model, get_param},
    tensor::Tensor,
};

/// Calibration pairs, the label of each sample being unused by the correction.
pub type CalibrationSet = Vec<(Tensor<f32>, Vec<usize>)>;

pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Dense layer initialized uniformly in `[-1/sqrt(in), 1/sqrt(in)]`, weight and bias alike.
pub fn random_dense<R: Rng>(
    rng: &mut R,
    in_features: usize,
    out_features: usize,
    bias: bool,
) -> Result<Dense> {
    let bound = 1.0 / (in_features as f32).sqrt();
    let weight = Tensor::random_uniform(rng, vec![out_features, in_features], -bound, bound);
    let bias = bias.then(|| Tensor::random_uniform(rng, vec![out_features], -bound, bound));
    Dense::new(weight, bias)
}

/// Square kernel convolution without padding, initialized like [`random_dense`] with
/// `in_channels * kernel * kernel` inputs per output.
pub fn random_conv<R: Rng>(
    rng: &mut R,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    bias: bool,
) -> Result<Convolution> {
    let bound = 1.0 / ((in_channels * kernel * kernel) as f32).sqrt();
    let filter = Tensor::random_uniform(
        rng,
        vec![out_channels, in_channels, kernel, kernel],
        -bound,
        bound,
    );
    let bias = bias.then(|| Tensor::random_uniform(rng, vec![out_channels], -bound, bound));
    Convolution::new(filter, bias, stride, 0)
}

/// `quant -> linear1 -> ... -> linearN -> dequant` with `features[i] -> features[i+1]` layers.
pub fn linear_chain<R: Rng>(rng: &mut R, features: &[usize]) -> Result<Model> {
    let mut root = Sequential::new();
    root.push("quant", QuantStub::new())?;
    for (i, (input, output)) in features.iter().tuple_windows().enumerate() {
        root.push(format!("linear{}", i + 1), random_dense(rng, *input, *output, true)?)?;
    }
    root.push("dequant", DeQuantStub)?;
    Ok(Model::new(root))
}

/// `quant -> conv2d1 -> ... -> conv2dN -> dequant` with `channels[i] -> channels[i+1]` layers.
pub fn conv_chain<R: Rng>(
    rng: &mut R,
    channels: &[usize],
    kernel: usize,
    stride: usize,
) -> Result<Model> {
    let mut root = Sequential::new();
    root.push("quant", QuantStub::new())?;
    for (i, (input, output)) in channels.iter().tuple_windows().enumerate() {
        root.push(
            format!("conv2d{}", i + 1),
            random_conv(rng, *input, *output, kernel, stride, true)?,
        )?;
    }
    root.push("dequant", DeQuantStub)?;
    Ok(Model::new(root))
}

/// `batches` inputs of shape `shape`, uniform in `[0, 1)`, the first dim being the batch size.
pub fn calibration_set<R: Rng>(rng: &mut R, batches: usize, shape: &[usize]) -> CalibrationSet {
    (0..batches)
        .map(|_| {
            let input = Tensor::random_uniform(rng, shape.to_vec(), 0.0, 1.0);
            let labels = vec![0; shape.first().copied().unwrap_or(1)];
            (input, labels)
        })
        .collect()
}

/// Multiplies the bias of every quantizable layer by `factor`, returning how many were scaled.
/// Quantized biases keep their scaling factor.
pub fn scale_biases(model: &mut Model, factor: f32) -> Result<usize> {
    let quantizable = model
        .named_layers()
        .into_iter()
        .filter_map(|(path, layer)| layer.supported().map(|kind| (path, kind)))
        .collect_vec();
    let mut scaled = 0;
    for (path, kind) in quantizable {
        let layer = model.get_module_mut(&path)?;
        let Ok(bias) = get_param(layer, "bias") else {
            continue;
        };
        let delta = bias
            .dequantize()
            .get_data()
            .iter()
            .map(|b| b * (factor - 1.0))
            .collect_vec();
        kind.apply_bias_delta(layer, &delta)?;
        scaled += 1;
    }
    Ok(scaled)
}
