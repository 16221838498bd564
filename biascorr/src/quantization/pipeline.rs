//! Post-training quantization of a float model.
//!
//! Calibration data is run through the float model once, recording the absolute maximum of the
//! input and output of every quantizable layer. The quantized model is a copy of the float one
//! where every quantizable layer has its weight on the activation domain and its bias on 32
//! bits at scale `S_input * S_weight`. When activations are quantized too, the layer is wrapped
//! in a [`QuantWrapper`] quantizing its output and the quant stubs are calibrated.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    layers::{Layer, LayerKind, QuantWrapper, Value},
    model::{HookHandle, Hooks, Model},
    quantization::ScalingFactor,
    tensor::Tensor,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    /// Fake-quantize activations at the output of every quantized layer and at the quant stubs.
    pub activations: bool,
    /// Store biases as 32 bit integers instead of keeping them in floating point.
    pub bias: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            activations: true,
            bias: true,
        }
    }
}

/// Quantizes a copy of `float_model`, calibrated on the inputs of `calibration`. The float
/// model is left untouched and the returned model has the same layer paths.
pub fn quantize_model<L>(
    float_model: &Model,
    calibration: &[(Tensor<f32>, L)],
    config: &QuantizationConfig,
) -> Result<Model> {
    if calibration.is_empty() {
        return Err(Error::ParameterError(
            "cannot calibrate quantization without data".to_string(),
        ));
    }
    let layers = float_model.named_layers();
    let quantizable = layers
        .iter()
        .filter_map(|(path, layer)| layer.supported().map(|kind| (path.clone(), kind)))
        .collect_vec();
    let stubs = layers
        .iter()
        .filter(|(_, layer)| layer.kind() == LayerKind::QuantStub)
        .map(|(path, _)| path.clone())
        .collect_vec();

    let mut hooks = Hooks::new();
    let observed = quantizable
        .iter()
        .map(|(path, _)| (hooks.attach_input(path), hooks.attach(path)))
        .collect_vec();
    let stub_inputs = stubs.iter().map(|path| hooks.attach_input(path)).collect_vec();
    for (input, _) in calibration {
        float_model.forward_with(input, Some(&mut hooks))?;
    }

    let mut quant_model = float_model.clone();
    for ((path, kind), (input, output)) in quantizable.iter().zip(observed) {
        let input_scale = ScalingFactor::from_absolute_max(abs_max(&hooks, input), None).scale();
        kind.quantize_params(quant_model.get_module_mut(path)?, input_scale, config.bias)?;
        if config.activations {
            let output_scaling = ScalingFactor::from_absolute_max(abs_max(&hooks, output), None);
            quant_model
                .replace_node(path, |layer| QuantWrapper::new(layer, output_scaling).into())?;
        }
        debug!(path = %path, kind = ?kind, input_scale, "quantized layer");
    }

    if config.activations {
        for (path, handle) in stubs.iter().zip(stub_inputs) {
            let scaling = ScalingFactor::from_absolute_max(abs_max(&hooks, handle), None);
            match quant_model.get_module_mut(path)? {
                Layer::QuantStub(stub) => stub.scaling = Some(scaling),
                other => {
                    return Err(Error::ShapeMismatch(format!(
                        "expected a quant stub at {path:?}, found {:?}",
                        other.kind()
                    )));
                }
            }
        }
    }

    info!(
        layers = quantizable.len(),
        stubs = stubs.len(),
        batches = calibration.len(),
        activations = config.activations,
        bias = config.bias,
        "model quantized"
    );
    Ok(quant_model)
}

fn abs_max(hooks: &Hooks, handle: HookHandle) -> f32 {
    hooks
        .captured(handle)
        .unwrap_or_default()
        .iter()
        .map(Value::dequantize)
        .flat_map(Tensor::into_data)
        .fold(0.0f32, |max, v| max.max(v.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::{Activation, DeQuantStub, Dense, QuantStub, Sequential},
        model::get_param,
    };

    fn model() -> Model {
        let linear1 = Dense::new(
            Tensor::new(vec![2, 2], vec![0.5, -0.5, 0.25, 1.0]),
            Some(Tensor::new(vec![2], vec![0.1, -0.2])),
        )
        .unwrap();
        let linear2 = Dense::new(Tensor::new(vec![1, 2], vec![1.0, 1.0]), None).unwrap();
        let root = Sequential::new()
            .with("quant", QuantStub::new())
            .and_then(|s| s.with("linear1", linear1))
            .and_then(|s| s.with("relu", Activation::Relu))
            .and_then(|s| s.with("linear2", linear2))
            .and_then(|s| s.with("dequant", DeQuantStub))
            .unwrap();
        Model::new(root)
    }

    fn calibration() -> Vec<(Tensor<f32>, ())> {
        vec![
            (Tensor::new(vec![1, 2], vec![1.0, -1.0]), ()),
            (Tensor::new(vec![1, 2], vec![0.5, 2.0]), ()),
        ]
    }

    #[test]
    fn test_quantize_model() -> Result<()> {
        let float_model = model();
        let config = QuantizationConfig::default();
        let quant_model = quantize_model(&float_model, &calibration(), &config)?;

        assert_eq!(quant_model.root().describe(), float_model.root().describe());
        assert_eq!(quant_model.named_layers().len(), float_model.named_layers().len());
        let linear1 = quant_model.get_module("linear1")?;
        assert!(get_param(linear1, "weight")?.is_quantized());
        assert!(get_param(linear1, "bias")?.is_quantized());
        assert!(matches!(
            quant_model.get_module("quant")?,
            Layer::QuantStub(stub) if stub.scaling().is_some()
        ));
        // the wrapper is only visible from the parent container
        let Layer::Sequential(root) = quant_model.root() else {
            panic!("root is a container");
        };
        assert_eq!(root.child("linear1").map(Layer::kind), Some(LayerKind::Wrapped));

        let input = Tensor::new(vec![1, 2], vec![0.75, 0.25]);
        let expected = float_model.forward(&input)?.into_float();
        let actual = quant_model.forward(&input)?;
        assert!(!actual.is_quantized());
        let actual = actual.into_float();
        assert!((expected.get_data()[0] - actual.get_data()[0]).abs() < 0.05);

        // float model is untouched
        assert!(!get_param(float_model.get_module("linear1")?, "weight")?.is_quantized());
        Ok(())
    }

    #[test]
    fn test_weights_only() -> Result<()> {
        let config = QuantizationConfig {
            activations: false,
            bias: false,
        };
        let quant_model = quantize_model(&model(), &calibration(), &config)?;
        let linear1 = quant_model.get_module("linear1")?;
        assert!(get_param(linear1, "weight")?.is_quantized());
        assert!(!get_param(linear1, "bias")?.is_quantized());
        assert!(matches!(
            quant_model.get_module("quant")?,
            Layer::QuantStub(stub) if stub.scaling().is_none()
        ));
        Ok(())
    }

    #[test]
    fn test_empty_calibration() {
        let empty: Vec<(Tensor<f32>, ())> = vec![];
        assert!(matches!(
            quantize_model(&model(), &empty, &QuantizationConfig::default()),
            Err(Error::ParameterError(_))
        ));
    }
}
