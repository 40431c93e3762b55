//! Layered JSON configuration.
//!
//! `config.json` is read first and `secrets.json` is deep-merged on top, so
//! credentials can live in a file with tighter permissions. Either file may
//! be missing.

use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{Error, Result, ResultExt};

/// Layer files in merge order.
pub const LAYERS: &[&str] = &["config.json", "secrets.json"];

fn read_layer(path: &Path) -> Result<Option<Value>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(&content).context(path.display().to_string())?;
    if !value.is_object() {
        return Err(Error::Config(format!("{} must hold a JSON object", path.display())));
    }
    Ok(Some(value))
}

/// Merge `overlay` into `base`; objects merge key by key, anything else
/// replaces.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Read and merge every layer present in `dir`.
pub fn load_layers(dir: &Path) -> Result<Value> {
    let mut merged = Value::Object(Map::new());

    for name in LAYERS {
        if let Some(layer) = read_layer(&dir.join(name))? {
            tracing::debug!(layer = %name, dir = %dir.display(), "Loaded config layer");
            deep_merge(&mut merged, layer);
        }
    }

    Ok(merged)
}
