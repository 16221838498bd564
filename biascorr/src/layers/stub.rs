//! Layers marking where a model enters and leaves the quantized domain, plus the reshaping
//! needed between convolutional and dense stacks.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    layers::Value,
    quantization::{QTensor, ScalingFactor},
};

/// Quantizes its input once calibrated; a float model leaves `scaling` unset and the stub
/// passes values through untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantStub {
    pub(crate) scaling: Option<ScalingFactor>,
}

impl QuantStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scaling(scaling: ScalingFactor) -> Self {
        Self {
            scaling: Some(scaling),
        }
    }

    pub fn scaling(&self) -> Option<&ScalingFactor> {
        self.scaling.as_ref()
    }

    pub fn op(&self, input: &Value) -> Result<Value> {
        Ok(match self.scaling {
            Some(scaling) => QTensor::quantize(&input.dequantize(), scaling).into(),
            None => input.clone(),
        })
    }
}

/// Brings a value back to floating point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeQuantStub;

impl DeQuantStub {
    pub fn op(&self, input: &Value) -> Result<Value> {
        Ok(input.dequantize().into())
    }
}

/// Collapses every dimension after the batch one, `[N, ...] -> [N, rest]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flatten;

impl Flatten {
    pub fn op(&self, input: &Value) -> Result<Value> {
        let shape = input.shape();
        if shape.is_empty() {
            return Err(Error::ParameterError(
                "cannot flatten a scalar tensor".to_string(),
            ));
        }
        let flat = vec![shape[0], shape[1..].iter().product()];
        Ok(match input {
            Value::Float(t) => t.reshape(flat)?.into(),
            Value::Quantized(q) => {
                QTensor::from_parts(q.values().reshape(flat)?, *q.scaling()).into()
            }
        })
    }
}
