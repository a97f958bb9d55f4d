//! Meta sidecar files.
//!
//! A source file `a.png` may carry an authored sidecar `a.png.meta`: a JSON5
//! object of key/value pairs, with platform-specific overrides under `pc:` /
//! `mobile:` children whose keys override the top level.

use kiln_vfs::{Vfs, VfsFlags};
use serde_json::Value;
use tracing::warn;

use crate::params::AssetPlatform;

/// Path of the sidecar for a source file.
pub fn meta_path(source_path: &str) -> String {
    format!("{}.meta", source_path)
}

/// Loads and flattens the sidecar of `source_path` for `platform`. Missing
/// or malformed sidecars yield an empty set.
pub fn load_meta(vfs: &Vfs, source_path: &str, platform: AssetPlatform) -> Vec<(String, String)> {
    let path = meta_path(source_path);
    let Ok(bytes) = vfs.read(&path, VfsFlags::empty()) else {
        return Vec::new();
    };
    let text = String::from_utf8_lossy(&bytes);

    match parse_meta(&text, platform) {
        Ok(pairs) => pairs,
        Err(err) => {
            warn!("malformed meta sidecar '{}': {}", path, err);
            Vec::new()
        }
    }
}

/// Parses sidecar text, applying the override child of `platform`.
pub fn parse_meta(
    text: &str,
    platform: AssetPlatform,
) -> Result<Vec<(String, String)>, json5::Error> {
    let root: Value = json5::from_str(text)?;
    let Value::Object(root) = root else {
        return Ok(Vec::new());
    };

    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut put = |key: &str, value: &Value| {
        if let Some(text) = scalar_to_string(value) {
            match pairs.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => *existing = text,
                None => pairs.push((key.to_owned(), text)),
            }
        }
    };

    for (key, value) in &root {
        if !matches!(value, Value::Object(_)) {
            put(key, value);
        }
    }

    let platform_key = platform.resolved().as_str();
    if let Some(Value::Object(overrides)) = root.get(platform_key) {
        for (key, value) in overrides {
            put(key, value);
        }
    }

    Ok(pairs)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
