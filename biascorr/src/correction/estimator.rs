//! Per-channel mean discrepancy between float and quantized outputs of the same layer.

use tracing::debug;

use crate::{
    error::{Error, Result},
    layers::Value,
    tensor::{Tensor, utilities::get_common_shape},
};

/// Mean of `float - quant` for every channel along `channel_axis`, over all batch and
/// non-channel positions of all pairs. Outputs are paired by position; quantized outputs are
/// dequantized first. When the trailing (spatial) dims of a pair differ, both tensors are
/// cropped to their common leading region. Accumulation is done in `f64` in a fixed order.
pub fn estimate(
    float_outputs: &[Value],
    quant_outputs: &[Value],
    channel_axis: usize,
) -> Result<Vec<f32>> {
    if float_outputs.len() != quant_outputs.len() {
        return Err(Error::ShapeMismatch(format!(
            "captured {} float outputs but {} quantized outputs",
            float_outputs.len(),
            quant_outputs.len()
        )));
    }
    if float_outputs.is_empty() {
        return Err(Error::ParameterError(
            "no outputs captured, cannot estimate a bias delta".to_string(),
        ));
    }

    let mut sums: Vec<f64> = Vec::new();
    let mut count = 0u64;
    for (i, (float, quant)) in float_outputs.iter().zip(quant_outputs).enumerate() {
        let (float, quant) = align(float.dequantize(), quant.dequantize(), channel_axis, i)?;
        let shape = float.shape();
        let channels = shape[channel_axis];
        if sums.is_empty() {
            sums = vec![0.0; channels];
        } else if sums.len() != channels {
            return Err(Error::ShapeMismatch(format!(
                "pair {i} has {channels} channels, previous pairs had {}",
                sums.len()
            )));
        }
        let inner = shape[channel_axis + 1..].iter().product::<usize>();
        for (idx, (f, q)) in float.get_data().iter().zip(quant.get_data()).enumerate() {
            sums[(idx / inner) % channels] += *f as f64 - *q as f64;
        }
        count += (float.numel() / channels.max(1)) as u64;
    }

    if count == 0 {
        return Err(Error::ParameterError(
            "captured outputs are empty, cannot estimate a bias delta".to_string(),
        ));
    }
    Ok(sums.into_iter().map(|s| (s / count as f64) as f32).collect())
}

/// Checks that a pair only differs in cropable dims and crops it to a common shape.
fn align(
    float: Tensor<f32>,
    quant: Tensor<f32>,
    channel_axis: usize,
    pair: usize,
) -> Result<(Tensor<f32>, Tensor<f32>)> {
    let (fs, qs) = (float.shape(), quant.shape());
    if fs.len() != qs.len() || fs.len() <= channel_axis {
        return Err(Error::ShapeMismatch(format!(
            "pair {pair}: float output {fs:?} and quantized output {qs:?} cannot be compared \
             along axis {channel_axis}"
        )));
    }
    if fs[0] != qs[0] || fs[channel_axis] != qs[channel_axis] {
        return Err(Error::ShapeMismatch(format!(
            "pair {pair}: batch or channel count differ between float output {fs:?} and \
             quantized output {qs:?}"
        )));
    }
    if fs == qs {
        return Ok((float, quant));
    }
    let common = get_common_shape(fs, qs);
    debug!(pair, float = ?fs, quant = ?qs, common = ?common, "cropping outputs to common region");
    Ok((float.crop(&common)?, quant.crop(&common)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::{QTensor, ScalingFactor};

    fn float(shape: Vec<usize>, data: Vec<f32>) -> Value {
        Tensor::new(shape, data).into()
    }

    #[test]
    fn test_dense_outputs() -> Result<()> {
        // [N=2, C=2]: channel 0 differs by 1 and 3, channel 1 by -2 and -2
        let f = vec![float(vec![2, 2], vec![1.0, 0.0, 3.0, 0.0])];
        let q = vec![float(vec![2, 2], vec![0.0, 2.0, 0.0, 2.0])];
        assert_eq!(estimate(&f, &q, 1)?, vec![2.0, -2.0]);
        Ok(())
    }

    #[test]
    fn test_mean_across_pairs_and_spatial_positions() -> Result<()> {
        // [N=1, C=2, H=1, W=2]
        let f = vec![
            float(vec![1, 2, 1, 2], vec![1.0, 1.0, 0.0, 0.0]),
            float(vec![1, 2, 1, 2], vec![3.0, 3.0, 0.0, 0.0]),
        ];
        let q = vec![
            float(vec![1, 2, 1, 2], vec![0.0, 0.0, 1.0, 0.0]),
            float(vec![1, 2, 1, 2], vec![0.0, 0.0, 1.0, 2.0]),
        ];
        assert_eq!(estimate(&f, &q, 1)?, vec![2.0, -1.0]);
        Ok(())
    }

    #[test]
    fn test_quantized_outputs_are_dequantized() -> Result<()> {
        let t = Tensor::new(vec![1, 2], vec![0.5, -0.5]);
        let q = QTensor::quantize(&t, ScalingFactor::from_absolute_max(1.0, None));
        let delta = estimate(&[t.clone().into()], &[q.into()], 1)?;
        assert!(delta.iter().all(|d| d.abs() < 1e-2));
        Ok(())
    }

    #[test]
    fn test_spatial_dims_are_cropped() -> Result<()> {
        // float output is 1x3, quantized 1x2: only the first two columns are compared
        let f = vec![float(vec![1, 1, 1, 3], vec![1.0, 1.0, 100.0])];
        let q = vec![float(vec![1, 1, 1, 2], vec![0.0, 0.0])];
        assert_eq!(estimate(&f, &q, 1)?, vec![1.0]);
        Ok(())
    }

    #[test]
    fn test_channel_mismatch() {
        let f = vec![float(vec![1, 2], vec![0.0; 2])];
        let q = vec![float(vec![1, 3], vec![0.0; 3])];
        assert!(matches!(estimate(&f, &q, 1), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_length_and_rank_mismatch() {
        let a = float(vec![1, 2], vec![0.0; 2]);
        let b = float(vec![1, 2, 1], vec![0.0; 2]);
        assert!(matches!(
            estimate(&[a.clone(), a.clone()], &[a.clone()], 1),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(estimate(&[a.clone()], &[b], 1), Err(Error::ShapeMismatch(_))));
        assert!(matches!(estimate(&[], &[], 1), Err(Error::ParameterError(_))));
    }

    #[test]
    fn test_deterministic() -> Result<()> {
        let f: Vec<Value> = (0..4)
            .map(|i| float(vec![2, 3], (0..6).map(|v| (v * i) as f32 * 0.1).collect()))
            .collect();
        let q: Vec<Value> = (0..4)
            .map(|i| float(vec![2, 3], (0..6).map(|v| (v + i) as f32 * 0.07).collect()))
            .collect();
        assert_eq!(estimate(&f, &q, 1)?, estimate(&f, &q, 1)?);
        Ok(())
    }
}
