//! The `.info` sidecar: per-directory metadata records.
//!
//! One sidecar per managed directory. It is a JSON mapping whose `"."` entry is the
//! directory's own [`Info`], and whose other entries are the info records of the files
//! in that directory, keyed by file name. Key order is preserved.
//!
//! Byte strings are stored as `{"__bytes__": "<hex>"}`; see [`bytes_value`] and
//! [`value_bytes`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::Result;

pub const INFO_FILE: &str = ".info";
pub const SELF_KEY: &str = ".";

pub const TIMESTAMP_KEY: &str = "__timestamp__";
pub const DIR_TYPE_KEY: &str = "dirType";
pub const SEQUENCE_PARAMS_KEY: &str = "sequenceParams";

/// Free-form metadata record of one node.
pub type Info = Map<String, Value>;

/// Directory type tag stored under `dirType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirType {
    Day,
    Slice,
    Cell,
    Protocol,
    ProtocolSequence,
    #[serde(untagged)]
    Other(String),
}

/// Returns the tag of `info`, if any.
pub fn dir_type(info: &Info) -> Option<DirType> {
    info.get(DIR_TYPE_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

pub fn timestamp(info: &Info) -> Option<f64> {
    info.get(TIMESTAMP_KEY).and_then(Value::as_f64)
}

/// Ordered `sequenceParams` mapping; empty if absent or malformed.
pub fn sequence_params(info: &Info) -> IndexMap<String, Vec<Value>> {
    let Some(Value::Object(params)) = info.get(SEQUENCE_PARAMS_KEY) else {
        return IndexMap::new();
    };
    params
        .iter()
        .filter_map(|(k, v)| v.as_array().map(|vals| (k.clone(), vals.clone())))
        .collect()
}

/// Reads a sidecar; a missing file is an empty sidecar.
pub(crate) fn read_sidecar(dir: &Path) -> Result<Info> {
    match fs::read(dir.join(INFO_FILE)) {
        Ok(bytes) if bytes.is_empty() => Ok(Info::new()),
        Ok(bytes) => match serde_json::from_slice(&bytes)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Info::new()),
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Info::new()),
        Err(e) => Err(e.into()),
    }
}

/// Writes a sidecar through a temporary sibling renamed into place.
pub(crate) fn write_sidecar(dir: &Path, sidecar: &Info) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(sidecar)?;
    super::write_atomic(&dir.join(INFO_FILE), &bytes)
}

/// Info record stored under `key` (`"."` for the directory itself).
pub(crate) fn entry(sidecar: &Info, key: &str) -> Info {
    match sidecar.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Info::new(),
    }
}

/// Top-level keys of `update` replace those of the existing entry.
pub(crate) fn merge_entry(sidecar: &mut Info, key: &str, update: Info) {
    let mut current = entry(sidecar, key);
    for (k, v) in update {
        current.insert(k, v);
    }
    sidecar.insert(key.to_string(), Value::Object(current));
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn dir_types() {
        let mut info = Info::new();
        assert_eq!(dir_type(&info), None);
        info.insert(DIR_TYPE_KEY.into(), json!("ProtocolSequence"));
        assert_eq!(dir_type(&info), Some(DirType::ProtocolSequence));
        info.insert(DIR_TYPE_KEY.into(), json!("Site"));
        assert_eq!(dir_type(&info), Some(DirType::Other("Site".into())));
    }

    #[test]
    fn sidecar_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_sidecar(dir.path()).unwrap().is_empty());
        let mut sc = Info::new();
        merge_entry(&mut sc, SELF_KEY, json!({"a": 1, "b": 2}).as_object().unwrap().clone());
        merge_entry(&mut sc, SELF_KEY, json!({"b": 3}).as_object().unwrap().clone());
        write_sidecar(dir.path(), &sc).unwrap();
        let back = read_sidecar(dir.path()).unwrap();
        assert_eq!(entry(&back, SELF_KEY), json!({"a": 1, "b": 3}).as_object().unwrap().clone());
    }
}
