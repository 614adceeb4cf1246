//! Parameter files: one CBOR document per app mapping widget id to value.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use panel_protocol::WireValue;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use super::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamsFile {
    pub app: String,
    pub values: BTreeMap<String, WireValue>,
}

pub fn params_path(dir: &Path, app: &str) -> PathBuf {
    dir.join(format!("{app}.params"))
}

/// Writes `params` to `path` atomically. Values that hold live objects
/// cannot be stored and are left out. Returns how many were written.
pub fn save_params(path: &Path, app: &str, params: &BTreeMap<String, Value>) -> Result<usize> {
    let mut values = BTreeMap::new();
    for (id, value) in params {
        match value.to_plain() {
            Some(plain) => {
                values.insert(id.clone(), plain);
            }
            None => warn!(app, widget = %id, "parameter holds an object, not saved"),
        }
    }
    let written = values.len();

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create parameter dir {}", dir.display()))?;
    let tmp = NamedTempFile::new_in(dir).context("failed to create temporary parameter file")?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        let file = ParamsFile {
            app: app.to_string(),
            values,
        };
        serde_cbor::to_writer(&mut writer, &file).context("failed to serialize parameters")?;
        writer.flush().context("failed to write parameters")?;
    }
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    info!(app, path = %path.display(), written, "parameters saved");
    Ok(written)
}

pub fn read_params_file(path: &Path) -> Result<ParamsFile> {
    let bytes = fs::read(path).with_context(|| format!("failed to read parameters at {}", path.display()))?;
    serde_cbor::from_slice(&bytes).context("parameter file is not valid CBOR")
}

pub fn load_params(path: &Path) -> Result<BTreeMap<String, Value>> {
    let file = read_params_file(path)?;
    Ok(file
        .values
        .into_iter()
        .map(|(id, v)| (id, Value::from_plain(v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::object::{HostObject, new_object};

    struct Opaque;

    impl HostObject for Opaque {
        fn type_name(&self) -> &'static str {
            "opaque"
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = params_path(dir.path(), "bench");
        let mut params = BTreeMap::new();
        params.insert("exposure".to_string(), Value::Float(0.25));
        params.insert("notes".to_string(), Value::str("dark frame"));
        params.insert("items".to_string(), Value::List(vec![Value::Int(1), Value::Int(2)]));

        assert_eq!(save_params(&path, "bench", &params).unwrap(), 3);
        assert_eq!(load_params(&path).unwrap(), params);
        assert_eq!(read_params_file(&path).unwrap().app, "bench");
    }

    #[test]
    fn objects_are_left_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = params_path(dir.path(), "bench");
        let mut params = BTreeMap::new();
        params.insert("live".to_string(), Value::Object(new_object(Opaque)));
        params.insert("n".to_string(), Value::Int(4));
        assert_eq!(save_params(&path, "bench", &params).unwrap(), 1);
        assert!(!load_params(&path).unwrap().contains_key("live"));
    }

    #[test]
    fn overwrite_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = params_path(dir.path(), "bench");
        let mut params = BTreeMap::new();
        params.insert("n".to_string(), Value::Int(1));
        save_params(&path, "bench", &params).unwrap();
        params.insert("n".to_string(), Value::Int(2));
        save_params(&path, "bench", &params).unwrap();
        assert_eq!(load_params(&path).unwrap()["n"], Value::Int(2));
    }

    #[test]
    fn garbage_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.params");
        fs::write(&path, b"\xff\x00garbage").unwrap();
        assert!(load_params(&path).is_err());
    }
}
