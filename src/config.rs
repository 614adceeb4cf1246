use async_trait::async_trait;
use dashmap::DashMap;
use panel_protocol::{DEFAULT_PERMITS, LogLevel};
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

/// Every settings key this crate reads starts with this.
pub const KEY_PREFIX: &str = "LABPANEL_";

/// A read-only source of `LABPANEL_*` settings.
#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    /// The known keys, sorted.
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn describe(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.describe())
    }
}

/// The process environment, seeded from a `.env` file when one exists.
/// Variables already set in the environment win over the file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    loaded: bool,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        let loaded = env_file.exists()
            && match dotenvy::from_path(&env_file) {
                Ok(()) => {
                    info!("loaded settings from {}", env_file.display());
                    true
                }
                Err(e) => {
                    warn!("cannot read {}: {e}", env_file.display());
                    false
                }
            };
        Box::new(Self { env_file, loaded })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = env::vars().map(|(k, _)| k).filter(|k| k.starts_with(KEY_PREFIX)).collect();
        keys.sort();
        keys
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.trim().is_empty())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        if self.loaded {
            format!("EnvConfigManager({})", self.env_file.display())
        } else {
            "EnvConfigManager(environment only)".to_string()
        }
    }
}

/// Fixed settings, for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.map.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn describe(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

// -----------------------------------------------------------------------------
// Typed runtime settings
// -----------------------------------------------------------------------------

pub const KEY_PERMITS: &str = "LABPANEL_PERMITS";
pub const KEY_SHUTDOWN_GRACE_MS: &str = "LABPANEL_SHUTDOWN_GRACE_MS";
pub const KEY_WORKER_MODE: &str = "LABPANEL_WORKER_MODE";
pub const KEY_WORKER_EXE: &str = "LABPANEL_WORKER_EXE";
pub const KEY_LOG_LEVEL: &str = "LABPANEL_LOG_LEVEL";
pub const KEY_LOG_DIR: &str = "LABPANEL_LOG_DIR";
pub const KEY_PARAMS_DIR: &str = "LABPANEL_PARAMS_DIR";
pub const KEY_SHM_DIR: &str = "LABPANEL_SHM_DIR";

const KNOWN_KEYS: [&str; 8] = [
    KEY_PERMITS,
    KEY_SHUTDOWN_GRACE_MS,
    KEY_WORKER_MODE,
    KEY_WORKER_EXE,
    KEY_LOG_LEVEL,
    KEY_LOG_DIR,
    KEY_PARAMS_DIR,
    KEY_SHM_DIR,
];

/// How an app's worker is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum WorkerMode {
    /// A child process running `labpanel worker`.
    #[default]
    Process,
    /// A thread of the supervisor process. Same protocol, no isolation.
    Thread,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub permits: usize,
    pub shutdown_grace: Duration,
    pub worker_mode: WorkerMode,
    /// Executable for process workers; the running binary when unset.
    pub worker_exe: Option<PathBuf>,
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
    pub params_dir: PathBuf,
    pub shm_dir: PathBuf,
    pub compact: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            permits: DEFAULT_PERMITS,
            shutdown_grace: Duration::from_millis(5000),
            worker_mode: WorkerMode::Process,
            worker_exe: None,
            log_level: LogLevel::Info,
            log_dir: None,
            params_dir: PathBuf::from("params"),
            shm_dir: env::temp_dir(),
            compact: false,
        }
    }
}

impl RuntimeConfig {
    /// Thread-hosted workers; what the tests and `--workers thread` use.
    pub fn threaded() -> Self {
        Self {
            worker_mode: WorkerMode::Thread,
            ..Self::default()
        }
    }

    /// Overlays every key the manager knows on top of the defaults.
    /// Unparsable values are logged and ignored.
    pub async fn load(manager: &ConfigManager) -> Self {
        let mut config = Self::default();
        let source = &manager.0;
        for key in source.keys().await {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warn!("unknown setting {key} ignored");
            }
        }

        if let Some(permits) = parsed::<usize>(source.get(KEY_PERMITS).await, KEY_PERMITS) {
            config.permits = permits.max(1);
        }
        if let Some(ms) = parsed::<u64>(source.get(KEY_SHUTDOWN_GRACE_MS).await, KEY_SHUTDOWN_GRACE_MS) {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(mode) = parsed::<WorkerMode>(source.get(KEY_WORKER_MODE).await, KEY_WORKER_MODE) {
            config.worker_mode = mode;
        }
        if let Some(level) = parsed::<LogLevel>(source.get(KEY_LOG_LEVEL).await, KEY_LOG_LEVEL) {
            config.log_level = level;
        }
        if let Some(exe) = source.get(KEY_WORKER_EXE).await {
            config.worker_exe = Some(PathBuf::from(exe));
        }
        if let Some(dir) = source.get(KEY_LOG_DIR).await {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = source.get(KEY_PARAMS_DIR).await {
            config.params_dir = PathBuf::from(dir);
        }
        if let Some(dir) = source.get(KEY_SHM_DIR).await {
            config.shm_dir = PathBuf::from(dir);
        }
        config
    }
}

fn parsed<T: FromStr>(raw: Option<String>, key: &str) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw}: not a valid value");
            None
        }
    }
}
