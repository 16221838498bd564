use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    layers::{Layer, Value},
    model::Hooks,
    quantization::{QTensor, ScalingFactor},
};

/// Quantization observer wrapped around a single layer: the wrapped layer runs as usual and its
/// output is quantized with the scaling factor observed during calibration. The wrapper is
/// transparent for path resolution, it does not add a segment of its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuantWrapper {
    pub(crate) module: Box<Layer>,
    pub(crate) output_scaling: ScalingFactor,
}

impl QuantWrapper {
    pub fn new(module: Layer, output_scaling: ScalingFactor) -> Self {
        Self {
            module: Box::new(module),
            output_scaling,
        }
    }

    pub fn module(&self) -> &Layer {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Layer {
        &mut self.module
    }

    pub fn output_scaling(&self) -> &ScalingFactor {
        &self.output_scaling
    }

    pub(crate) fn eval(
        &self,
        input: &Value,
        path: &str,
        hooks: Option<&mut Hooks>,
    ) -> Result<Value> {
        let output = self.module.eval(input, path, hooks)?;
        Ok(QTensor::quantize(&output.into_float(), self.output_scaling).into())
    }
}
