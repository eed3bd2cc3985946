//! Named parameter mappings and their installation into modules.
//!
//! A [`StateDict`] is an ordered `name -> tensor` mapping, as read from a
//! safetensors file or a PyTorch pickle. Nested mappings (`state_dict`,
//! `g_ema`, `G`) appear as dotted key prefixes.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use restyle_core::{Error, Result};

/// Key of the sub-mapping Lightning-style checkpoints nest everything under.
pub const NESTED_STATE_KEY: &str = "state_dict";

/// Ordered mapping from dotted parameter names to tensors.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: Vec<(String, Tensor)>,
    index: HashMap<String, usize>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a checkpoint file onto `device`.
    ///
    /// `.pt`, `.pth`, `.ckpt` and `.bin` files are read as PyTorch pickles,
    /// everything else as safetensors. Only top-level pickle tensors are read;
    /// use [`StateDict::load_nested`] for checkpoints that nest sub-mappings.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        Self::load_nested(path, &[], device)
    }

    /// Load a checkpoint, flattening the pickle sub-mappings named in `nested`
    /// under `key.` prefixes.
    ///
    /// Safetensors files are flat already, so `nested` only affects pickles. A
    /// listed key the pickle does not hold is skipped.
    pub fn load_nested<P: AsRef<Path>>(path: P, nested: &[&str], device: &Device) -> Result<Self> {
        let path = path.as_ref();
        std::fs::metadata(path).map_err(|e| Error::io(path, e))?;

        let is_pickle = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("pt" | "pth" | "ckpt" | "bin")
        );
        if !is_pickle {
            let mut entries: Vec<(String, Tensor)> =
                candle_core::safetensors::load(path, device)?.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            return Ok(entries.into_iter().collect());
        }

        // nested dicts are skipped by the top-level read
        let mut dict = read_pickle(path, None, device)?;
        for key in nested {
            match read_pickle(path, Some(*key), device) {
                Ok(inner) => {
                    tracing::debug!("{}: read {} tensors under {}", path.display(), inner.len(), key);
                    dict.extend(inner.with_prefix(key));
                }
                Err(e) => tracing::debug!("{}: no {} mapping ({})", path.display(), key, e),
            }
        }
        Ok(dict)
    }

    /// Write the mapping as a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self.entries.iter().cloned().collect();
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        Ok(())
    }

    /// Insert or replace an entry, keeping the position of an existing key.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        match self.index.get(&name) {
            Some(&i) => self.entries[i].1 = tensor,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, tensor));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether any key lives under `name.`.
    pub fn has_prefix(&self, name: &str) -> bool {
        let prefix = format!("{}.", name);
        self.keys().any(|k| k.starts_with(&prefix))
    }

    /// Entries under `name.` with the prefix stripped; no nesting resolution.
    pub fn strip_prefix(&self, name: &str) -> Self {
        let prefix = format!("{}.", name);
        self.entries
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
            .collect()
    }

    /// Extract the parameters of submodule `name`.
    ///
    /// Descends into a nested `state_dict` mapping first when one is present,
    /// then keeps every entry under `name.` with that prefix removed. The
    /// source mapping is left untouched and relative order is preserved.
    pub fn get_keys(&self, name: &str) -> Self {
        if self.has_prefix(NESTED_STATE_KEY) {
            self.strip_prefix(NESTED_STATE_KEY).strip_prefix(name)
        } else {
            self.strip_prefix(name)
        }
    }

    /// Prepend `name.` to every key.
    pub fn with_prefix(&self, name: &str) -> Self {
        self.entries
            .iter()
            .map(|(k, v)| (format!("{}.{}", name, k), v.clone()))
            .collect()
    }

    /// Append every entry of `other`.
    pub fn extend(&mut self, other: StateDict) {
        for (k, v) in other.entries {
            self.insert(k, v);
        }
    }
}

impl FromIterator<(String, Tensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut dict = StateDict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

/// Tensors of a PyTorch pickle, from the top level or the sub-mapping at `key`.
fn read_pickle(path: &Path, key: Option<&str>, device: &Device) -> Result<StateDict> {
    candle_core::pickle::read_all_with_key(path, key)?
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
        .collect()
}

/// How strictly a state dict must match a module's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Every parameter present and no extra keys
    Strict,
    /// Install whatever matches; keep existing values for the rest
    Partial,
}

/// Outcome of installing a state dict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// A module whose parameters live in a [`VarMap`].
pub trait ParameterModule {
    /// Name used in diagnostics.
    fn module_name(&self) -> &str;

    fn varmap(&self) -> &VarMap;

    /// Install `state` into this module's parameters.
    ///
    /// Shapes are checked for every matched key before anything is written,
    /// so a failed load leaves the module unchanged.
    fn load_state_dict(&self, state: &StateDict, mode: LoadMode) -> Result<LoadReport> {
        load_into_varmap(self.varmap(), self.module_name(), state, mode)
    }

    /// Snapshot of every parameter, sorted by name.
    fn state_dict(&self) -> Result<StateDict> {
        let data = self
            .varmap()
            .data()
            .lock()
            .map_err(|_| Error::InvalidInput(format!("{} parameters are poisoned", self.module_name())))?;
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| (name.clone(), data[name].as_tensor().clone()))
            .collect())
    }
}

pub fn load_into_varmap(
    varmap: &VarMap,
    module: &str,
    state: &StateDict,
    mode: LoadMode,
) -> Result<LoadReport> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::InvalidInput(format!("{} parameters are poisoned", module)))?;

    let provided: HashSet<&str> = state.keys().collect();
    let mut missing: Vec<String> = data
        .keys()
        .filter(|name| !provided.contains(name.as_str()))
        .cloned()
        .collect();
    missing.sort();
    let unexpected: Vec<String> = state
        .keys()
        .filter(|name| !data.contains_key(*name))
        .map(str::to_string)
        .collect();

    if mode == LoadMode::Strict && (!missing.is_empty() || !unexpected.is_empty()) {
        return Err(Error::StateDictMismatch {
            module: module.to_string(),
            missing,
            unexpected,
        });
    }

    let mut updates = Vec::new();
    for (name, tensor) in state.iter() {
        let Some(var) = data.get(name) else {
            continue;
        };
        if var.dims() != tensor.dims() {
            return Err(Error::ShapeMismatch {
                key: name.to_string(),
                expected: var.dims().to_vec(),
                found: tensor.dims().to_vec(),
            });
        }
        let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
        updates.push((name, var, value));
    }

    let mut loaded = Vec::with_capacity(updates.len());
    for (name, var, value) in updates {
        var.set(&value)?;
        loaded.push(name.to_string());
    }

    Ok(LoadReport {
        loaded,
        missing,
        unexpected,
    })
}
