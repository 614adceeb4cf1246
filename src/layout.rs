//! App documents: which widgets an app has, what they are called, and which
//! user functions their signals are bound to.
//!
//! ```yaml
//! name: scan
//! modules: [scan]
//! on_init: [scan.setup]
//! widgets:
//!   - kind: number
//!     id: exposure
//!     attrs: { value: 0.5, min: 0.0, max: 10.0 }
//!   - kind: button
//!     id: go
//!     actions: { clicked: scan.acquire }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use panel_protocol::CallableRef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid app document {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("unknown widget kind `{0}`")]
    UnknownKind(String),

    #[error("widget `{widget}`: {message}")]
    Widget { widget: String, message: String },

    #[error("bad action `{action}` on signal `{signal}`: expected `module.function`")]
    BadAction { signal: String, action: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AppDocument {
    /// Display name; defaults to the file stem.
    #[serde(default)]
    pub name: Option<String>,
    /// User modules to import, `<app_dir>/<module>.rhai`. Defaults to the
    /// module named like the document.
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub on_init: Vec<String>,
    #[serde(default)]
    pub on_close: Vec<String>,
    #[serde(default)]
    pub widgets: Vec<WidgetSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WidgetSpec {
    pub kind: String,
    /// Layout id. Anonymous widgets take part in the lifecycle but user code
    /// cannot reach them.
    #[serde(default)]
    pub id: Option<String>,
    /// Signal name to `module.function`.
    #[serde(default)]
    pub actions: BTreeMap<String, String>,
    /// Whether the widget's value is part of the saved parameters.
    #[serde(default = "default_save")]
    pub save: bool,
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
}

fn default_save() -> bool {
    true
}

impl WidgetSpec {
    pub fn new(kind: &str, id: Option<&str>) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.map(str::to_string),
            actions: BTreeMap::new(),
            save: true,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_action(mut self, signal: &str, action: &str) -> Self {
        self.actions.insert(signal.to_string(), action.to_string());
        self
    }

    pub fn with_attr(mut self, name: &str, value: serde_json::Value) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    /// How the widget is named in logs and error boxes.
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => format!("{}#{}", self.kind, id),
            None => format!("{} (anonymous)", self.kind),
        }
    }

    pub fn parsed_actions(&self) -> Result<BTreeMap<String, CallableRef>, LayoutError> {
        self.actions
            .iter()
            .map(|(signal, action)| {
                action
                    .parse::<CallableRef>()
                    .map(|c| (signal.clone(), c))
                    .map_err(|_| LayoutError::BadAction {
                        signal: signal.clone(),
                        action: action.clone(),
                    })
            })
            .collect()
    }
}

/// An app document together with the directory its modules live in.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedApp {
    pub name: String,
    pub dir: PathBuf,
    pub document: AppDocument,
}

impl LoadedApp {
    pub fn from_document(name: &str, dir: &Path, mut document: AppDocument) -> Self {
        if document.modules.is_empty() {
            document.modules.push(name.to_string());
        }
        let name = document.name.clone().unwrap_or_else(|| name.to_string());
        Self {
            name,
            dir: dir.to_path_buf(),
            document,
        }
    }
}

pub fn load_app(path: &Path) -> Result<LoadedApp, LayoutError> {
    let text = fs::read_to_string(path).map_err(|source| LayoutError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document: AppDocument =
        serde_yaml_bw::from_str(&text).map_err(|e| LayoutError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("app")
        .to_string();
    let dir = path.parent().unwrap_or(Path::new("."));
    Ok(LoadedApp::from_document(&stem, dir, document))
}

/// A workspace file is a YAML list of app files, relative to the workspace.
pub fn load_workspace(path: &Path) -> Result<Vec<PathBuf>, LayoutError> {
    let text = fs::read_to_string(path).map_err(|source| LayoutError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: Vec<PathBuf> =
        serde_yaml_bw::from_str(&text).map_err(|e| LayoutError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    let base = path.parent().unwrap_or(Path::new("."));
    Ok(entries
        .into_iter()
        .map(|p| if p.is_absolute() { p } else { base.join(p) })
        .collect())
}

/// JSON schema of the app document, for editor tooling.
pub fn document_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(AppDocument)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DOC: &str = r#"
name: Spectrometer
on_init: [spec.setup]
widgets:
  - kind: number
    id: exposure
    attrs: { value: 0.5 }
  - kind: button
    id: go
    actions: { clicked: spec.acquire }
  - kind: label
    save: false
"#;

    #[test]
    fn loads_document_and_defaults_module() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spec.yaml");
        fs::write(&path, DOC).unwrap();

        let app = load_app(&path).unwrap();
        assert_eq!(app.name, "Spectrometer");
        assert_eq!(app.document.modules, vec!["spec".to_string()]);
        assert_eq!(app.dir, dir.path());
        assert_eq!(app.document.widgets.len(), 3);
        assert!(app.document.widgets[0].save);
        assert!(!app.document.widgets[2].save);
        assert_eq!(app.document.widgets[2].id, None);
    }

    #[test]
    fn actions_parse_to_callables() {
        let spec = WidgetSpec::new("button", Some("b")).with_action("clicked", "m.f");
        let actions = spec.parsed_actions().unwrap();
        assert_eq!(actions["clicked"], CallableRef::new("m", "f"));

        let bad = WidgetSpec::new("button", None).with_action("clicked", "nodot");
        assert!(matches!(bad.parsed_actions(), Err(LayoutError::BadAction { .. })));
    }

    #[test]
    fn workspace_paths_are_relative_to_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench.yaml");
        fs::write(&path, "- a.yaml\n- /abs/b.yaml\n").unwrap();
        let apps = load_workspace(&path).unwrap();
        assert_eq!(apps, vec![dir.path().join("a.yaml"), PathBuf::from("/abs/b.yaml")]);
    }

    #[test]
    fn malformed_document_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        fs::write(&path, "widgets: 3\n").unwrap();
        assert!(matches!(load_app(&path), Err(LayoutError::Parse { .. })));
    }

    #[test]
    fn schema_mentions_widgets() {
        let schema = document_schema().to_string();
        assert!(schema.contains("widgets"));
    }
}
