//! Output capture for named layers.
//!
//! A [`Hooks`] registry is handed to [`super::Model::forward_with`]; every node whose path has
//! a registration gets its output (or input) appended to the registration's buffer, in call
//! order. Registrations are explicit: [`Hooks::attach`] returns a [`HookHandle`] that
//! [`Hooks::detach`] consumes to hand the captured values back.

use std::collections::{BTreeMap, HashMap};

use crate::layers::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookHandle(usize);

/// Which side of a layer a registration observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookPoint {
    Input,
    Output,
}

#[derive(Debug)]
struct Capture {
    path: String,
    point: HookPoint,
    values: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct Hooks {
    next_id: usize,
    by_path: HashMap<(String, HookPoint), HookHandle>,
    captures: BTreeMap<HookHandle, Capture>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the output of the layer at `path`. Attaching a path twice returns the handle
    /// of the existing registration, outputs are never recorded twice.
    pub fn attach(&mut self, path: &str) -> HookHandle {
        self.attach_at(path, HookPoint::Output)
    }

    /// Captures the input of the layer at `path`.
    pub fn attach_input(&mut self, path: &str) -> HookHandle {
        self.attach_at(path, HookPoint::Input)
    }

    pub fn attach_at(&mut self, path: &str, point: HookPoint) -> HookHandle {
        if let Some(handle) = self.by_path.get(&(path.to_string(), point)) {
            return *handle;
        }
        let handle = HookHandle(self.next_id);
        self.next_id += 1;
        self.by_path.insert((path.to_string(), point), handle);
        self.captures.insert(
            handle,
            Capture {
                path: path.to_string(),
                point,
                values: Vec::new(),
            },
        );
        handle
    }

    /// Removes the registration and returns everything it captured. `None` if the handle was
    /// already detached.
    pub fn detach(&mut self, handle: HookHandle) -> Option<Vec<Value>> {
        let capture = self.captures.remove(&handle)?;
        self.by_path.remove(&(capture.path, capture.point));
        Some(capture.values)
    }

    pub fn captured(&self, handle: HookHandle) -> Option<&[Value]> {
        self.captures.get(&handle).map(|c| c.values.as_slice())
    }

    pub fn is_attached(&self, path: &str, point: HookPoint) -> bool {
        self.by_path.contains_key(&(path.to_string(), point))
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_path.clear();
        self.captures.clear();
    }

    pub(crate) fn record_output(&mut self, path: &str, value: &Value) {
        self.record(path, HookPoint::Output, value)
    }

    pub(crate) fn record_input(&mut self, path: &str, value: &Value) {
        self.record(path, HookPoint::Input, value)
    }

    fn record(&mut self, path: &str, point: HookPoint, value: &Value) {
        if self.captures.is_empty() {
            return;
        }
        if let Some(handle) = self.by_path.get(&(path.to_string(), point)) {
            if let Some(capture) = self.captures.get_mut(handle) {
                capture.values.push(value.clone());
            }
        }
    }
}
