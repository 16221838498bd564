use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    layers::Value,
    quantization::QTensor,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
}

impl Activation {
    /// Quantized inputs stay quantized: relu maps every value below the zero point onto it.
    pub fn op(&self, input: &Value) -> Result<Value> {
        match self {
            Activation::Relu => Ok(match input {
                Value::Float(t) => t.relu().into(),
                Value::Quantized(q) => {
                    let zero_point = q.scaling().zero_point();
                    let values = q.values().map(|v| (*v).max(zero_point));
                    QTensor::from_parts(values, *q.scaling()).into()
                }
            }),
        }
    }
}
