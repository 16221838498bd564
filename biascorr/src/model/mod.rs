//! The model graph: a tree of named layers addressed by dotted paths.
//!
//! The root is a [`Sequential`] container whose path is the empty string; a child `linear1` of
//! a container `block` lives at `block.linear1`. Quantization wrappers never add a segment, so
//! a float model and its quantized copy share the same paths.

mod hooks;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    layers::{Layer, Param, Sequential, Value, sequential::join_path},
    tensor::Tensor,
};
pub use hooks::{HookHandle, HookPoint, Hooks};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Model {
    root: Layer,
}

impl Model {
    pub fn new(root: Sequential) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Layer {
        &self.root
    }

    /// Runs a full forward pass.
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Value> {
        self.forward_with(input, None)
    }

    /// Runs a full forward pass, reporting the inputs and outputs of every instrumented layer
    /// to `hooks`. Instrumentation does not change the returned value.
    pub fn forward_with(
        &self,
        input: &Tensor<f32>,
        mut hooks: Option<&mut Hooks>,
    ) -> Result<Value> {
        let input = Value::from(input.clone());
        if let Some(h) = hooks.as_deref_mut() {
            h.record_input("", &input);
        }
        let output = self.root.eval(&input, "", hooks.as_deref_mut())?;
        if let Some(h) = hooks.as_deref_mut() {
            h.record_output("", &output);
        }
        Ok(output)
    }

    /// All layers with their dotted paths, depth first, parents before children and siblings in
    /// declaration order. The root comes first with the empty path. Wrappers are looked through.
    pub fn named_layers(&self) -> Vec<(String, &Layer)> {
        let mut out = Vec::new();
        collect_named(self.root.unwrapped(), String::new(), &mut out);
        out
    }

    /// Resolves a dotted path, looking through quantization wrappers at every step.
    pub fn get_module(&self, path: &str) -> Result<&Layer> {
        let mut current = self.root.unwrapped();
        if path.is_empty() {
            return Ok(current);
        }
        for segment in path.split('.') {
            current = match current {
                Layer::Sequential(seq) => seq
                    .child(segment)
                    .ok_or_else(|| missing_segment(path, segment))?
                    .unwrapped(),
                other => return Err(not_a_container(path, segment, other)),
            };
        }
        Ok(current)
    }

    pub fn get_module_mut(&mut self, path: &str) -> Result<&mut Layer> {
        let mut current = self.root.unwrapped_mut();
        if path.is_empty() {
            return Ok(current);
        }
        for segment in path.split('.') {
            current = match current {
                Layer::Sequential(seq) => seq
                    .child_mut(segment)
                    .ok_or_else(|| missing_segment(path, segment))?
                    .unwrapped_mut(),
                other => return Err(not_a_container(path, segment, other)),
            };
        }
        Ok(current)
    }

    /// Replaces the node at `path`, wrappers included, by `f(node)`.
    pub(crate) fn replace_node<F>(&mut self, path: &str, f: F) -> Result<()>
    where
        F: FnOnce(Layer) -> Layer,
    {
        let (parent, name) = match path.rsplit_once('.') {
            Some((parent, name)) => (parent, name),
            None => ("", path),
        };
        let Layer::Sequential(seq) = self.get_module_mut(parent)? else {
            return Err(Error::NotFound(format!("parent of {path:?} is not a container")));
        };
        let node = seq
            .child_mut(name)
            .ok_or_else(|| missing_segment(path, name))?;
        let old = std::mem::replace(node, Layer::Sequential(Sequential::new()));
        *node = f(old);
        Ok(())
    }
}

/// Free function flavour of [`Model::get_module`].
pub fn get_module<'a>(model: &'a Model, path: &str) -> Result<&'a Layer> {
    model.get_module(path)
}

/// Retrieves the `weight` or `bias` parameter of a layer, quantized or not depending on the
/// state of the layer.
pub fn get_param<'a>(layer: &'a Layer, name: &str) -> Result<&'a Param> {
    let layer = layer.unwrapped();
    let param = match (layer, name) {
        (Layer::Dense(dense), "weight") => Some(dense.weight()),
        (Layer::Dense(dense), "bias") => dense.bias(),
        (Layer::Convolution(conv), "weight") => Some(conv.filter()),
        (Layer::Convolution(conv), "bias") => conv.bias(),
        _ => None,
    };
    param.ok_or_else(|| {
        Error::NotFound(format!(
            "parameter {name:?} on layer {}",
            layer.describe()
        ))
    })
}

fn collect_named<'a>(layer: &'a Layer, path: String, out: &mut Vec<(String, &'a Layer)>) {
    out.push((path.clone(), layer));
    if let Layer::Sequential(seq) = layer {
        for (name, child) in seq.children() {
            collect_named(child.unwrapped(), join_path(&path, name), out);
        }
    }
}

fn missing_segment(path: &str, segment: &str) -> Error {
    Error::NotFound(format!("layer {segment:?} of path {path:?}"))
}

fn not_a_container(path: &str, segment: &str, layer: &Layer) -> Error {
    Error::NotFound(format!(
        "layer {segment:?} of path {path:?}: parent is a {:?}, not a container",
        layer.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::{Activation, DeQuantStub, Dense, LayerKind, QuantStub, QuantWrapper},
        quantization::ScalingFactor,
    };

    fn dense(i: usize, o: usize) -> Dense {
        Dense::new(
            Tensor::new(vec![o, i], vec![1.0; o * i]),
            Some(Tensor::new(vec![o], vec![0.5; o])),
        )
        .unwrap()
    }

    fn nested_model() -> Model {
        let block = Sequential::new()
            .with("linear", dense(4, 4))
            .and_then(|s| s.with("relu", Activation::Relu))
            .unwrap();
        let root = Sequential::new()
            .with("quant", QuantStub::new())
            .and_then(|s| s.with("linear1", dense(3, 4)))
            .and_then(|s| s.with("block", block))
            .and_then(|s| s.with("dequant", DeQuantStub))
            .unwrap();
        Model::new(root)
    }

    #[test]
    fn test_named_layers_pre_order() {
        let model = nested_model();
        let paths: Vec<String> = model.named_layers().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            paths,
            vec!["", "quant", "linear1", "block", "block.linear", "block.relu", "dequant"]
        );
    }

    #[test]
    fn test_get_module() -> Result<()> {
        let model = nested_model();
        assert_eq!(model.get_module("")?.kind(), LayerKind::Sequential);
        assert_eq!(model.get_module("block.linear")?.kind(), LayerKind::Dense);
        assert_eq!(get_module(&model, "linear1")?.kind(), LayerKind::Dense);
        Ok(())
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let model = nested_model();
        for path in ["linear4", "block.conv", "linear1.weight", "block.linear.extra"] {
            assert!(
                matches!(model.get_module(path), Err(Error::NotFound(_))),
                "{path} should not resolve"
            );
        }
    }

    #[test]
    fn test_get_module_through_wrapper() -> Result<()> {
        let mut model = nested_model();
        model.replace_node("block.linear", |l| {
            QuantWrapper::new(l, ScalingFactor::default()).into()
        })?;
        assert_eq!(model.get_module("block.linear")?.kind(), LayerKind::Dense);
        let paths: Vec<String> = model.named_layers().into_iter().map(|(p, _)| p).collect();
        assert!(paths.contains(&"block.linear".to_string()));
        Ok(())
    }

    #[test]
    fn test_get_param() -> Result<()> {
        let model = nested_model();
        let linear = model.get_module("linear1")?;
        assert_eq!(get_param(linear, "weight")?.shape(), &[4, 3]);
        assert_eq!(get_param(linear, "bias")?.shape(), &[4]);
        assert!(!get_param(linear, "bias")?.is_quantized());
        assert!(matches!(get_param(linear, "gamma"), Err(Error::NotFound(_))));
        let relu = model.get_module("block.relu")?;
        assert!(matches!(get_param(relu, "weight"), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_forward_with_hooks_does_not_change_output() -> Result<()> {
        let model = nested_model();
        let input = Tensor::new(vec![2, 3], vec![0.1, 0.2, 0.3, -0.1, -0.2, -0.3]);
        let plain = model.forward(&input)?;

        let mut hooks = Hooks::new();
        let linear1 = hooks.attach("linear1");
        let nested = hooks.attach("block.linear");
        let root = hooks.attach("");
        let observed = model.forward_with(&input, Some(&mut hooks))?;
        model.forward_with(&input, Some(&mut hooks))?;

        assert_eq!(plain, observed);
        assert_eq!(hooks.captured(linear1).map(<[Value]>::len), Some(2));
        assert_eq!(hooks.captured(root).map(|v| v[0].clone()), Some(plain));
        let nested = hooks.detach(nested).unwrap_or_default();
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[0].shape(), &[2, 4]);
        Ok(())
    }

    #[test]
    fn test_independent_hooks_per_model() -> Result<()> {
        let float_model = nested_model();
        let mut other = nested_model();
        other.replace_node("linear1", |l| {
            QuantWrapper::new(l, ScalingFactor::from_absolute_max(4.0, None)).into()
        })?;
        let input = Tensor::new(vec![1, 3], vec![0.1, 0.2, 0.3]);

        let (mut float_hooks, mut quant_hooks) = (Hooks::new(), Hooks::new());
        let f = float_hooks.attach("linear1");
        let q = quant_hooks.attach("linear1");
        float_model.forward_with(&input, Some(&mut float_hooks))?;
        other.forward_with(&input, Some(&mut quant_hooks))?;

        let float_out = float_hooks.detach(f).unwrap_or_default();
        let quant_out = quant_hooks.detach(q).unwrap_or_default();
        assert_eq!(float_out.len(), 1);
        assert_eq!(quant_out.len(), 1);
        assert!(!float_out[0].is_quantized());
        assert!(quant_out[0].is_quantized());
        Ok(())
    }
}
