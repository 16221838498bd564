use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    layers::{Layer, Value},
    model::Hooks,
};

/// Ordered container of named layers, evaluated one after the other.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Sequential {
    children: Vec<(String, Layer)>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a child. Names must be non empty, unique among siblings and free of `.`, the
    /// path separator.
    pub fn push(&mut self, name: impl Into<String>, layer: impl Into<Layer>) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.contains('.') {
            return Err(Error::ParameterError(format!(
                "invalid layer name {name:?}: names must be non empty and cannot contain '.'"
            )));
        }
        if self.child(&name).is_some() {
            return Err(Error::ParameterError(format!(
                "a layer named {name:?} already exists"
            )));
        }
        self.children.push((name, layer.into()));
        Ok(())
    }

    /// Builder flavour of [`Sequential::push`].
    pub fn with(mut self, name: impl Into<String>, layer: impl Into<Layer>) -> Result<Self> {
        self.push(name, layer)?;
        Ok(self)
    }

    pub fn child(&self, name: &str) -> Option<&Layer> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, l)| l)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, l)| l)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Layer)> {
        self.children.iter().map(|(n, l)| (n.as_str(), l))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub(crate) fn eval(
        &self,
        input: &Value,
        path: &str,
        mut hooks: Option<&mut Hooks>,
    ) -> Result<Value> {
        let mut current = input.clone();
        for (name, layer) in &self.children {
            let child_path = join_path(path, name);
            if let Some(h) = hooks.as_deref_mut() {
                h.record_input(&child_path, &current);
            }
            current = layer.eval(&current, &child_path, hooks.as_deref_mut())?;
            if let Some(h) = hooks.as_deref_mut() {
                h.record_output(&child_path, &current);
            }
        }
        Ok(current)
    }
}

pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Activation;

    #[test]
    fn test_push_validates_names() {
        let mut seq = Sequential::new();
        assert!(seq.push("relu", Activation::Relu).is_ok());
        assert!(matches!(
            seq.push("relu", Activation::Relu),
            Err(Error::ParameterError(_))
        ));
        assert!(seq.push("a.b", Activation::Relu).is_err());
        assert!(seq.push("", Activation::Relu).is_err());
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "conv"), "conv");
        assert_eq!(join_path("block", "conv"), "block.conv");
    }
}
