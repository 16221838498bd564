//! Row-major tensors and the affine kernels the supported layers are built on.
//!
//! Activations follow the `[batch, channel, ...]` layout: dense layers consume and produce
//! `[N, C]` tensors, convolutions `[N, C, H, W]`.

mod error;
pub(crate) mod utilities;

use itertools::Itertools;
use rand::{Rng, distributions::Uniform};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub use error::TensorError;
use utilities::{flat_index, get_all_coords, strides};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor<T>")]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

/// Unchecked serialized form of a [`Tensor`], validated by [`Tensor::try_new`].
#[derive(Deserialize)]
struct RawTensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T> TryFrom<RawTensor<T>> for Tensor<T> {
    type Error = TensorError;

    fn try_from(raw: RawTensor<T>) -> Result<Self, TensorError> {
        Tensor::try_new(raw.shape, raw.data)
    }
}

impl<T> Tensor<T> {
    /// Panics if `data` does not hold exactly `shape.product()` elements.
    pub(crate) fn new(shape: Vec<usize>, data: Vec<T>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "data length does not match shape {shape:?}"
        );
        Self { shape, data }
    }

    /// Creates a new tensor, checking that `data` holds exactly `shape.product()` elements.
    pub fn try_new(shape: Vec<usize>, data: Vec<T>) -> Result<Self, TensorError> {
        let total_size = shape.iter().product::<usize>();
        if data.len() != total_size {
            return Err(TensorError::ParameterError(format!(
                "expected data length to be {} for shape {:?}, supplied data had length: {}",
                total_size,
                shape,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn get_data(&self) -> &[T] {
        &self.data
    }

    pub(crate) fn get_data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn map<U, F: FnMut(&T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }
}

impl<T: Clone> Tensor<T> {
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Tensor<T>, TensorError> {
        Tensor::try_new(shape, self.data.clone())
    }

    /// Returns the leading region of `self` with the given shape. Every dimension of `shape`
    /// must be at most the corresponding dimension of `self`.
    pub fn crop(&self, shape: &[usize]) -> Result<Tensor<T>, TensorError> {
        if shape.len() != self.rank() {
            return Err(TensorError::ShapeError(format!(
                "cannot crop rank {} tensor to rank {}",
                self.rank(),
                shape.len()
            )));
        }
        if shape.iter().zip(self.shape.iter()).any(|(new, old)| new > old) {
            return Err(TensorError::ShapeError(format!(
                "crop region {:?} exceeds tensor shape {:?}",
                shape, self.shape
            )));
        }
        if shape == self.shape.as_slice() {
            return Ok(self.clone());
        }
        let st = strides(&self.shape);
        let data = get_all_coords(shape)
            .iter()
            .map(|coords| self.data[flat_index(coords, &st)].clone())
            .collect_vec();
        Ok(Tensor {
            shape: shape.to_vec(),
            data,
        })
    }
}

impl Tensor<f32> {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; size],
        }
    }

    /// Samples every element uniformly in `[low, high)`.
    pub fn random_uniform<R: Rng>(rng: &mut R, shape: Vec<usize>, low: f32, high: f32) -> Self {
        let size = shape.iter().product();
        let dist = Uniform::new(low, high);
        Self {
            shape,
            data: (0..size).map(|_| rng.sample(&dist)).collect(),
        }
    }

    pub fn relu(&self) -> Self {
        self.map(|v| v.max(0.0))
    }

    /// Euclidean norm, accumulated in `f64`.
    pub fn norm(&self) -> f64 {
        self.data
            .iter()
            .map(|v| (*v as f64) * (*v as f64))
            .sum::<f64>()
            .sqrt()
    }

    /// Fully connected layer: `input [N, in] x weight [out, in]^T + bias [out]`.
    pub fn linear(
        &self,
        weight: &Tensor<f32>,
        bias: Option<&Tensor<f32>>,
    ) -> Result<Tensor<f32>, TensorError> {
        if self.rank() != 2 || weight.rank() != 2 {
            return Err(TensorError::ShapeError(format!(
                "linear expects a [N, in] input and a [out, in] weight, got {:?} and {:?}",
                self.shape, weight.shape
            )));
        }
        let (n, in_features) = (self.shape[0], self.shape[1]);
        let (out_features, weight_in) = (weight.shape[0], weight.shape[1]);
        if in_features == 0 {
            return Err(TensorError::ShapeError(
                "linear needs at least one input feature".to_string(),
            ));
        }
        if in_features != weight_in {
            return Err(TensorError::ShapeError(format!(
                "input has {in_features} features but weight expects {weight_in}"
            )));
        }
        check_bias(bias, out_features)?;

        let mut data = Vec::with_capacity(n * out_features);
        for row in self.data.chunks(in_features) {
            for (o, w_row) in weight.data.chunks(in_features).enumerate() {
                let acc = row.iter().zip(w_row.iter()).map(|(x, w)| x * w).sum::<f32>();
                data.push(acc + bias.map(|b| b.data[o]).unwrap_or(0.0));
            }
        }
        Ok(Tensor {
            shape: vec![n, out_features],
            data,
        })
    }

    /// 2D convolution (cross-correlation) of a `[N, C, H, W]` input with a `[O, C, KH, KW]`
    /// filter, symmetric zero padding and equal stride on both spatial axes.
    /// Output planes are computed in parallel but each one is accumulated serially, so the
    /// result does not depend on the thread count.
    pub fn conv2d(
        &self,
        filter: &Tensor<f32>,
        bias: Option<&Tensor<f32>>,
        stride: usize,
        padding: usize,
    ) -> Result<Tensor<f32>, TensorError> {
        if self.rank() != 4 || filter.rank() != 4 {
            return Err(TensorError::ShapeError(format!(
                "conv2d expects [N, C, H, W] input and [O, C, KH, KW] filter, got {:?} and {:?}",
                self.shape, filter.shape
            )));
        }
        if stride == 0 {
            return Err(TensorError::ParameterError(
                "conv2d stride must be non zero".to_string(),
            ));
        }
        let (n, c, h, w) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        let (o, fc, kh, kw) = (
            filter.shape[0],
            filter.shape[1],
            filter.shape[2],
            filter.shape[3],
        );
        if c != fc {
            return Err(TensorError::ShapeError(format!(
                "input has {c} channels but filter expects {fc}"
            )));
        }
        let (padded_h, padded_w) = (h + 2 * padding, w + 2 * padding);
        if padded_h < kh || padded_w < kw {
            return Err(TensorError::ShapeError(format!(
                "kernel {kh}x{kw} larger than padded input {padded_h}x{padded_w}"
            )));
        }
        check_bias(bias, o)?;

        let oh = (padded_h - kh) / stride + 1;
        let ow = (padded_w - kw) / stride + 1;
        let planes: Vec<Vec<f32>> = (0..n * o)
            .into_par_iter()
            .map(|idx| {
                let (b, oc) = (idx / o, idx % o);
                let mut plane = vec![0.0f32; oh * ow];
                for ic in 0..c {
                    let input_plane = &self.data[(b * c + ic) * h * w..(b * c + ic + 1) * h * w];
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let wv = filter.data[((oc * c + ic) * kh + ky) * kw + kx];
                            for oy in 0..oh {
                                let iy = oy * stride + ky;
                                if iy < padding || iy - padding >= h {
                                    continue;
                                }
                                let iy = iy - padding;
                                for ox in 0..ow {
                                    let ix = ox * stride + kx;
                                    if ix < padding || ix - padding >= w {
                                        continue;
                                    }
                                    plane[oy * ow + ox] += wv * input_plane[iy * w + ix - padding];
                                }
                            }
                        }
                    }
                }
                if let Some(bias) = bias {
                    plane.iter_mut().for_each(|v| *v += bias.data[oc]);
                }
                plane
            })
            .collect();

        Ok(Tensor {
            shape: vec![n, o, oh, ow],
            data: planes.concat(),
        })
    }
}

fn check_bias(bias: Option<&Tensor<f32>>, channels: usize) -> Result<(), TensorError> {
    match bias {
        Some(b) if b.shape != [channels] => Err(TensorError::ShapeError(format!(
            "bias of shape {:?} does not match {} output channels",
            b.shape, channels
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_new_checks_length() {
        assert!(Tensor::try_new(vec![2, 3], vec![0.0f32; 6]).is_ok());
        assert!(matches!(
            Tensor::try_new(vec![2, 3], vec![0.0f32; 5]),
            Err(TensorError::ParameterError(_))
        ));
    }

    #[test]
    fn test_linear() -> Result<(), TensorError> {
        // x = [[1, 2]], W = [[1, 0], [0, 1], [1, 1]], b = [0.5, -0.5, 1]
        let x = Tensor::new(vec![1, 2], vec![1.0, 2.0]);
        let w = Tensor::new(vec![3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let b = Tensor::new(vec![3], vec![0.5, -0.5, 1.0]);
        let out = x.linear(&w, Some(&b))?;
        assert_eq!(out.shape(), &[1, 3]);
        assert_eq!(out.get_data(), &[1.5, 1.5, 4.0]);
        assert!(x.linear(&w, Some(&Tensor::new(vec![2], vec![0.0, 0.0]))).is_err());
        Ok(())
    }

    #[test]
    fn test_linear_without_features() {
        let x = Tensor::<f32>::zeros(vec![1, 0]);
        let w = Tensor::<f32>::zeros(vec![2, 0]);
        assert!(matches!(x.linear(&w, None), Err(TensorError::ShapeError(_))));
    }

    #[test]
    fn test_deserialize_checks_length() {
        let ok: Result<Tensor<f32>, _> =
            serde_json::from_str(r#"{"shape": [2], "data": [1.0, 2.0]}"#);
        assert_eq!(ok.ok(), Some(Tensor::new(vec![2], vec![1.0, 2.0])));
        let short: Result<Tensor<f32>, _> =
            serde_json::from_str(r#"{"shape": [1, 1, 2, 2], "data": [1.0]}"#);
        assert!(short.is_err());
    }

    #[test]
    fn test_conv2d_stride_and_bias() -> Result<(), TensorError> {
        // single 4x4 plane of ones, 2x2 kernel of ones, stride 2 -> every output is 4 + bias
        let x = Tensor::new(vec![1, 1, 4, 4], vec![1.0; 16]);
        let f = Tensor::new(vec![2, 1, 2, 2], vec![1.0; 8]);
        let b = Tensor::new(vec![2], vec![0.0, 1.0]);
        let out = x.conv2d(&f, Some(&b), 2, 0)?;
        assert_eq!(out.shape(), &[1, 2, 2, 2]);
        assert_eq!(out.get_data(), &[4.0, 4.0, 4.0, 4.0, 5.0, 5.0, 5.0, 5.0]);
        Ok(())
    }

    #[test]
    fn test_conv2d_zero_padding() -> Result<(), TensorError> {
        let x = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let f = Tensor::new(vec![1, 1, 3, 3], vec![1.0; 9]);
        let out = x.conv2d(&f, None, 1, 1)?;
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        // every 3x3 window centered on the 2x2 input covers the whole input
        assert_eq!(out.get_data(), &[10.0, 10.0, 10.0, 10.0]);
        Ok(())
    }

    #[test]
    fn test_crop_keeps_leading_region() -> Result<(), TensorError> {
        let x = Tensor::new(vec![1, 2, 3], (0..6).map(|v| v as f32).collect());
        let c = x.crop(&[1, 2, 2])?;
        assert_eq!(c.get_data(), &[0.0, 1.0, 3.0, 4.0]);
        assert!(x.crop(&[1, 3, 3]).is_err());
        Ok(())
    }
}
