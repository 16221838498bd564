use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    layers::{Param, Value},
    quantization::{BIAS_DOMAIN, QTensor, ScalingFactor},
    tensor::Tensor,
};

/// Fully connected layer, `y = x W^T + b` with `W` of shape `[out, in]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawDense")]
pub struct Dense {
    pub(crate) weight: Param,
    pub(crate) bias: Option<Param>,
}

/// Unchecked serialized form of a [`Dense`] layer.
#[derive(Deserialize)]
struct RawDense {
    weight: Param,
    bias: Option<Param>,
}

impl TryFrom<RawDense> for Dense {
    type Error = Error;

    fn try_from(raw: RawDense) -> Result<Self> {
        Self::from_params(raw.weight, raw.bias)
    }
}

impl Dense {
    pub fn new(weight: Tensor<f32>, bias: Option<Tensor<f32>>) -> Result<Self> {
        Self::from_params(weight.into(), bias.map(Into::into))
    }

    /// Builds the layer from parameters that may already be quantized.
    pub fn from_params(weight: Param, bias: Option<Param>) -> Result<Self> {
        let shape = weight.shape();
        if shape.len() != 2 {
            return Err(Error::ParameterError(format!(
                "dense weight must be a [out, in] matrix, got shape {shape:?}"
            )));
        }
        if shape.contains(&0) {
            return Err(Error::ParameterError(format!(
                "dense weight of shape {shape:?} has an empty dimension"
            )));
        }
        if let Some(b) = &bias {
            if b.shape() != [shape[0]] {
                return Err(Error::ShapeMismatch(format!(
                    "dense bias of shape {:?} does not match {} outputs",
                    b.shape(),
                    shape[0]
                )));
            }
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Param> {
        self.bias.as_ref()
    }

    pub fn op(&self, input: &Value) -> Result<Value> {
        let bias = self.bias.as_ref().map(Param::dequantize);
        let output = input
            .dequantize()
            .linear(&self.weight.dequantize(), bias.as_ref())?;
        Ok(output.into())
    }

    /// Adds a per output feature delta to the bias. Returns `false` when the layer has no bias.
    pub fn correct_bias(&mut self, delta: &[f32]) -> Result<bool> {
        match self.bias.as_mut() {
            Some(bias) => bias.add_channel_delta(delta).map(|_| true),
            None => Ok(false),
        }
    }

    /// Stores the weight on the activation domain and the bias at the accumulator scale
    /// `S_input * S_weight`.
    pub(crate) fn quantize_params(&mut self, input_scale: f32, quantize_bias: bool) {
        let weight = QTensor::quantize_per_tensor(&self.weight.dequantize(), None);
        let weight_scale = weight.scaling().scale();
        self.weight = weight.into();
        if quantize_bias {
            if let Some(bias) = self.bias.as_mut() {
                let scaling =
                    ScalingFactor::from_scale(input_scale * weight_scale, Some(BIAS_DOMAIN));
                *bias = QTensor::quantize(&bias.dequantize(), scaling).into();
            }
        }
    }
}
