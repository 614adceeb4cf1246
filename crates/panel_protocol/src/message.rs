use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::flow::DEFAULT_PERMITS;
use crate::handle::{CallableRef, HandleRef, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

/// Which worker-side wrapper a widget gets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxyKind {
    /// Pure forwarding remote handle.
    #[default]
    Generic,
    Timer,
    /// Drives the generator factory `action` while the button is pressed.
    RunButton {
        #[serde(default)]
        action: Option<CallableRef>,
        #[serde(default)]
        fixed_cadence: bool,
    },
    Shell,
    /// Pixels travel through a file-backed shared mapping of `capacity` bytes.
    Image { path: PathBuf, capacity: usize },
}

/// What the worker needs to build one widget wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetPrototype {
    pub handle: HandleRef,
    #[serde(default)]
    pub proxy: ProxyKind,
}

/// First frame a worker receives: everything it needs to reach `running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInit {
    pub worker: WorkerId,
    pub app_dir: PathBuf,
    pub modules: Vec<String>,
    /// Widgets reachable from user code, keyed by layout id.
    pub widgets: BTreeMap<String, WidgetPrototype>,
    /// Specialty proxies of anonymous widgets; started and stopped but not
    /// reachable by name.
    #[serde(default)]
    pub anonymous: Vec<WidgetPrototype>,
    #[serde(default = "default_permits")]
    pub permits: usize,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_permits() -> usize {
    DEFAULT_PERMITS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleId;

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Critical.as_filter(), "error");
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn init_defaults_permits() {
        let json = r#"{"worker":1,"app_dir":"/tmp/app","modules":["main"],"widgets":{}}"#;
        let init: WorkerInit = serde_json::from_str(json).unwrap();
        assert_eq!(init.permits, DEFAULT_PERMITS);
        assert_eq!(init.log_level, LogLevel::Info);
    }

    #[test]
    fn proxy_kind_is_tagged() {
        let proto = WidgetPrototype {
            handle: HandleRef::new(HandleId(5)),
            proxy: ProxyKind::RunButton {
                action: Some(CallableRef::new("main", "sweep")),
                fixed_cadence: true,
            },
        };
        let s = serde_json::to_string(&proto).unwrap();
        assert!(s.contains(r#""kind":"run_button""#));
        let back: WidgetPrototype = serde_json::from_str(&s).unwrap();
        assert_eq!(back, proto);
    }
}
