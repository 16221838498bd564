//! The two representations a tensor can take inside a model, either as an activation flowing
//! through the forward pass or as a parameter stored on a layer.

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    quantization::QTensor,
    tensor::Tensor,
};

#[derive(Clone, Debug, PartialEq, From, Serialize, Deserialize)]
pub enum Value {
    Float(Tensor<f32>),
    Quantized(QTensor),
}

/// Layer parameters share the representation of activations.
pub type Param = Value;

impl Value {
    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Float(t) => t.shape(),
            Value::Quantized(q) => q.shape(),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Value::Quantized(_))
    }

    /// Floating point view of the value, dequantizing if needed.
    pub fn dequantize(&self) -> Tensor<f32> {
        match self {
            Value::Float(t) => t.clone(),
            Value::Quantized(q) => q.dequantize(),
        }
    }

    pub fn into_float(self) -> Tensor<f32> {
        match self {
            Value::Float(t) => t,
            Value::Quantized(q) => q.dequantize(),
        }
    }

    /// Adds `delta[c]` to every element of channel `c` of a 1-D parameter. Quantized parameters
    /// are dequantized, updated and quantized back with their original scaling factor.
    pub fn add_channel_delta(&mut self, delta: &[f32]) -> Result<()> {
        if self.shape() != [delta.len()] {
            return Err(Error::ShapeMismatch(format!(
                "delta of length {} cannot be applied to parameter of shape {:?}",
                delta.len(),
                self.shape()
            )));
        }
        match self {
            Value::Float(t) => {
                t.get_data_mut()
                    .iter_mut()
                    .zip(delta)
                    .for_each(|(v, d)| *v += d);
            }
            Value::Quantized(q) => {
                let scaling = *q.scaling();
                let mut float = q.dequantize();
                float
                    .get_data_mut()
                    .iter_mut()
                    .zip(delta)
                    .for_each(|(v, d)| *v += d);
                *q = QTensor::quantize(&float, scaling);
            }
        }
        Ok(())
    }
}
