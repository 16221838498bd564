use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    layers::{Param, Value},
    quantization::{BIAS_DOMAIN, QTensor, ScalingFactor},
    tensor::Tensor,
};

/// Convolution layer description (weights)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawConvolution")]
pub struct Convolution {
    /// `[out_channels, in_channels, kh, kw]`
    pub(crate) filter: Param,
    pub(crate) bias: Option<Param>,
    pub(crate) stride: usize,
    pub(crate) padding: usize,
}

#[derive(Deserialize)]
struct RawConvolution {
    filter: Param,
    bias: Option<Param>,
    stride: usize,
    padding: usize,
}

impl TryFrom<RawConvolution> for Convolution {
    type Error = Error;

    fn try_from(raw: RawConvolution) -> Result<Self> {
        Self::from_params(raw.filter, raw.bias, raw.stride, raw.padding)
    }
}

impl Convolution {
    pub fn new(
        filter: Tensor<f32>,
        bias: Option<Tensor<f32>>,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        Self::from_params(filter.into(), bias.map(Into::into), stride, padding)
    }

    /// Builds the layer from parameters that may already be quantized.
    pub fn from_params(
        filter: Param,
        bias: Option<Param>,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        let shape = filter.shape();
        if shape.len() != 4 {
            return Err(Error::ParameterError(format!(
                "convolution filter must have shape [out, in, kh, kw], got {shape:?}"
            )));
        }
        if shape.contains(&0) {
            return Err(Error::ParameterError(format!(
                "convolution filter of shape {shape:?} has an empty dimension"
            )));
        }
        if stride == 0 {
            return Err(Error::ParameterError(
                "convolution stride must be non zero".to_string(),
            ));
        }
        if let Some(b) = &bias {
            if b.shape() != [shape[0]] {
                return Err(Error::ShapeMismatch(format!(
                    "convolution bias of shape {:?} does not match {} output channels",
                    b.shape(),
                    shape[0]
                )));
            }
        }
        Ok(Self {
            filter,
            bias,
            stride,
            padding,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.filter.shape()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.filter.shape()[0]
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        (self.filter.shape()[2], self.filter.shape()[3])
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn filter(&self) -> &Param {
        &self.filter
    }

    pub fn bias(&self) -> Option<&Param> {
        self.bias.as_ref()
    }

    pub fn op(&self, input: &Value) -> Result<Value> {
        let bias = self.bias.as_ref().map(Param::dequantize);
        let output = input.dequantize().conv2d(
            &self.filter.dequantize(),
            bias.as_ref(),
            self.stride,
            self.padding,
        )?;
        Ok(output.into())
    }

    /// Adds a per output channel delta to the bias. Returns `false` when the layer has no bias.
    pub fn correct_bias(&mut self, delta: &[f32]) -> Result<bool> {
        match self.bias.as_mut() {
            Some(bias) => bias.add_channel_delta(delta).map(|_| true),
            None => Ok(false),
        }
    }

    pub(crate) fn quantize_params(&mut self, input_scale: f32, quantize_bias: bool) {
        let filter = QTensor::quantize_per_tensor(&self.filter.dequantize(), None);
        let filter_scale = filter.scaling().scale();
        self.filter = filter.into();
        if quantize_bias {
            if let Some(bias) = self.bias.as_mut() {
                let scaling =
                    ScalingFactor::from_scale(input_scale * filter_scale, Some(BIAS_DOMAIN));
                *bias = QTensor::quantize(&bias.dequantize(), scaling).into();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_output_shape() -> Result<()> {
        // 3 -> 4 channels, kernel 5, stride 5 over 125x125 gives 25x25
        let conv = Convolution::new(
            Tensor::zeros(vec![4, 3, 5, 5]),
            Some(Tensor::new(vec![4], vec![1.0, 2.0, 3.0, 4.0])),
            5,
            0,
        )?;
        let out = conv.op(&Tensor::zeros(vec![2, 3, 125, 125]).into())?;
        assert_eq!(out.shape(), &[2, 4, 25, 25]);
        // zero filter: output is the bias broadcast over every position
        let out = out.dequantize();
        assert!(out.get_data()[..625].iter().all(|v| *v == 1.0));
        assert!(out.get_data()[3 * 625..4 * 625].iter().all(|v| *v == 4.0));
        Ok(())
    }

    #[test]
    fn test_conv_rejects_bad_params() {
        assert!(Convolution::new(Tensor::zeros(vec![4, 3, 5]), None, 1, 0).is_err());
        assert!(Convolution::new(Tensor::zeros(vec![4, 3, 5, 5]), None, 0, 0).is_err());
        assert!(matches!(
            Convolution::new(
                Tensor::zeros(vec![4, 3, 5, 5]),
                Some(Tensor::zeros(vec![3])),
                1,
                0
            ),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_malformed_filter() {
        // 4 elements announced, a single one given
        let short = r#"{"filter": {"Float": {"shape": [1, 1, 2, 2], "data": [1.0]}},
            "bias": null, "stride": 1, "padding": 0}"#;
        assert!(serde_json::from_str::<Convolution>(short).is_err());
        let zero_stride = r#"{"filter": {"Float": {"shape": [1, 1, 1, 1], "data": [1.0]}},
            "bias": null, "stride": 0, "padding": 0}"#;
        assert!(serde_json::from_str::<Convolution>(zero_stride).is_err());
        let ok = r#"{"filter": {"Float": {"shape": [1, 1, 1, 1], "data": [2.0]}},
            "bias": null, "stride": 1, "padding": 0}"#;
        assert!(serde_json::from_str::<Convolution>(ok).is_ok());
    }

    #[test]
    fn test_conv_channel_mismatch_is_reported() -> Result<()> {
        let conv = Convolution::new(Tensor::zeros(vec![4, 3, 2, 2]), None, 1, 0)?;
        let res = conv.op(&Tensor::zeros(vec![1, 2, 4, 4]).into());
        assert!(matches!(res, Err(Error::Tensor(_))));
        Ok(())
    }
}
