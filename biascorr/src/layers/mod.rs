pub mod activation;
pub mod convolution;
pub mod dense;
pub mod sequential;
pub mod stub;
pub mod value;
pub mod wrapper;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    model::Hooks,
};
pub use activation::Activation;
pub use convolution::Convolution;
pub use dense::Dense;
pub use sequential::Sequential;
pub use stub::{DeQuantStub, Flatten, QuantStub};
pub use value::{Param, Value};
pub use wrapper::QuantWrapper;

#[derive(Clone, Debug, From, Serialize, Deserialize)]
pub enum Layer {
    Sequential(Sequential),
    Dense(Dense),
    Convolution(Convolution),
    Activation(Activation),
    Flatten(Flatten),
    QuantStub(QuantStub),
    DeQuantStub(DeQuantStub),
    // quantization observer around another layer, transparent for path resolution
    Wrapped(QuantWrapper),
}

/// Runtime kind of a [`Layer`], used to look up its capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Sequential,
    Dense,
    Convolution,
    Activation,
    Flatten,
    QuantStub,
    DeQuantStub,
    Wrapped,
}

/// Closed set of layer kinds eligible for bias correction: affine transforms with a bias
/// indexed by output channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupportedLayer {
    Dense,
    Convolution,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Sequential(_) => LayerKind::Sequential,
            Layer::Dense(_) => LayerKind::Dense,
            Layer::Convolution(_) => LayerKind::Convolution,
            Layer::Activation(_) => LayerKind::Activation,
            Layer::Flatten(_) => LayerKind::Flatten,
            Layer::QuantStub(_) => LayerKind::QuantStub,
            Layer::DeQuantStub(_) => LayerKind::DeQuantStub,
            Layer::Wrapped(_) => LayerKind::Wrapped,
        }
    }

    /// Looks through any number of quantization wrappers.
    pub fn unwrapped(&self) -> &Layer {
        match self {
            Layer::Wrapped(w) => w.module().unwrapped(),
            other => other,
        }
    }

    pub fn unwrapped_mut(&mut self) -> &mut Layer {
        match self {
            Layer::Wrapped(w) => w.module_mut().unwrapped_mut(),
            other => other,
        }
    }

    pub fn supported(&self) -> Option<SupportedLayer> {
        SupportedLayer::from_kind(self.unwrapped().kind())
    }

    /// Run the operation associated with that layer with the given input. `path` is the dotted
    /// path of this layer, used to report outputs of nested layers to `hooks`.
    pub(crate) fn eval(
        &self,
        input: &Value,
        path: &str,
        hooks: Option<&mut Hooks>,
    ) -> Result<Value> {
        match self {
            Layer::Sequential(seq) => seq.eval(input, path, hooks),
            Layer::Wrapped(wrapper) => wrapper.eval(input, path, hooks),
            Layer::Dense(dense) => dense.op(input),
            Layer::Convolution(conv) => conv.op(input),
            Layer::Activation(activation) => activation.op(input),
            Layer::Flatten(flatten) => flatten.op(input),
            Layer::QuantStub(stub) => stub.op(input),
            Layer::DeQuantStub(stub) => stub.op(input),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Layer::Sequential(seq) => format!("Sequential: {} children", seq.len()),
            Layer::Dense(dense) => format!(
                "Dense: ({},{})",
                dense.in_features(),
                dense.out_features()
            ),
            Layer::Convolution(conv) => {
                let (kh, kw) = conv.kernel_size();
                format!(
                    "Conv: ({},{},{},{}) stride {} padding {}",
                    conv.out_channels(),
                    conv.in_channels(),
                    kh,
                    kw,
                    conv.stride(),
                    conv.padding()
                )
            }
            Layer::Activation(Activation::Relu) => "RELU".to_string(),
            Layer::Flatten(_) => "Flatten".to_string(),
            Layer::QuantStub(stub) => match stub.scaling() {
                Some(s) => format!("QuantStub: scale {}", s.scale()),
                None => "QuantStub: uncalibrated".to_string(),
            },
            Layer::DeQuantStub(_) => "DeQuantStub".to_string(),
            Layer::Wrapped(w) => format!(
                "QuantWrapper(scale {}): {}",
                w.output_scaling().scale(),
                w.module().describe()
            ),
        }
    }
}

impl SupportedLayer {
    pub fn from_kind(kind: LayerKind) -> Option<Self> {
        match kind {
            LayerKind::Dense => Some(SupportedLayer::Dense),
            LayerKind::Convolution => Some(SupportedLayer::Convolution),
            LayerKind::Sequential
            | LayerKind::Activation
            | LayerKind::Flatten
            | LayerKind::QuantStub
            | LayerKind::DeQuantStub
            | LayerKind::Wrapped => None,
        }
    }

    /// Axis of the layer's output holding the channels its bias is indexed by:
    /// `[N, C]` for dense layers, `[N, C, H, W]` for convolutions.
    pub fn channel_axis(&self) -> usize {
        match self {
            SupportedLayer::Dense | SupportedLayer::Convolution => 1,
        }
    }

    pub fn has_bias(&self, layer: &Layer) -> Result<bool> {
        match (self, layer.unwrapped()) {
            (SupportedLayer::Dense, Layer::Dense(dense)) => Ok(dense.bias().is_some()),
            (SupportedLayer::Convolution, Layer::Convolution(conv)) => Ok(conv.bias().is_some()),
            (_, other) => Err(self.kind_mismatch(other)),
        }
    }

    /// Adds `delta` to the bias of `layer`. Returns `false` if the layer has no bias.
    pub fn apply_bias_delta(&self, layer: &mut Layer, delta: &[f32]) -> Result<bool> {
        match (self, layer.unwrapped_mut()) {
            (SupportedLayer::Dense, Layer::Dense(dense)) => dense.correct_bias(delta),
            (SupportedLayer::Convolution, Layer::Convolution(conv)) => conv.correct_bias(delta),
            (_, other) => Err(self.kind_mismatch(other)),
        }
    }

    /// Replaces the parameters of `layer` by their quantized counterparts, given the scale of
    /// the layer's input.
    pub(crate) fn quantize_params(
        &self,
        layer: &mut Layer,
        input_scale: f32,
        quantize_bias: bool,
    ) -> Result<()> {
        match (self, layer.unwrapped_mut()) {
            (SupportedLayer::Dense, Layer::Dense(dense)) => {
                dense.quantize_params(input_scale, quantize_bias)
            }
            (SupportedLayer::Convolution, Layer::Convolution(conv)) => {
                conv.quantize_params(input_scale, quantize_bias)
            }
            (_, other) => return Err(self.kind_mismatch(other)),
        }
        Ok(())
    }

    fn kind_mismatch(&self, other: &Layer) -> Error {
        Error::ShapeMismatch(format!(
            "expected a {:?} layer, found {:?}",
            self,
            other.kind()
        ))
    }
}
