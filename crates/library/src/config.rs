use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPolicy {
    /// Stop at the first file that fails to parse.
    #[default]
    Abort,
    /// Log failing files and keep going.
    Continue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub music_dir: String,
    pub cover_dir: String,
    pub state_path: String,
    pub compute_gains: bool,
    pub mp3gain_path: String,
    pub workers: usize,
    pub queue_depth: usize,
    pub scan_policy: ScanPolicy,
    pub push_batch_size: usize,
    pub artist_rewrites: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000/api/v1".to_string(),
            music_dir: "".to_string(),
            cover_dir: "".to_string(),
            state_path: "last_update.json".to_string(),
            compute_gains: true,
            mp3gain_path: "mp3gain".to_string(),
            workers: 0,
            queue_depth: 64,
            scan_policy: ScanPolicy::Abort,
            push_batch_size: 100,
            artist_rewrites: HashMap::new(),
        }
    }
}

/// Everything the scanner needs, with paths already resolved.
#[derive(Clone, Debug)]
pub struct ScanConfig {
    pub music_dir: PathBuf,
    pub cover_dir: Option<PathBuf>,
    pub workers: usize,
    pub queue_depth: usize,
    pub policy: ScanPolicy,
    pub artist_rewrites: HashMap<String, String>,
}

impl ScanConfig {
    pub fn new(music_dir: PathBuf) -> Self {
        Self {
            music_dir,
            cover_dir: None,
            workers: default_workers(),
            queue_depth: 64,
            policy: ScanPolicy::Abort,
            artist_rewrites: HashMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn scan_config(&self, config_path: &Path) -> ScanConfig {
        let cover_dir = self.cover_dir.trim();
        ScanConfig {
            music_dir: resolve_path(config_path, self.music_dir.trim()),
            cover_dir: if cover_dir.is_empty() {
                None
            } else {
                Some(resolve_path(config_path, cover_dir))
            },
            workers: if self.workers == 0 {
                default_workers()
            } else {
                self.workers
            },
            queue_depth: self.queue_depth.max(1),
            policy: self.scan_policy,
            artist_rewrites: self.artist_rewrites.clone(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("UPDATE_MUSIC_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => PathBuf::from("update_music.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ClientConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ClientConfig = serde_yaml::from_str(&contents)?;
        if config.push_batch_size == 0 {
            config.push_batch_size = 100;
        }
        if config.state_path.trim().is_empty() {
            config.state_path = "last_update.json".to_string();
        }
        let trimmed = config.server_url.trim_end_matches('/').to_string();
        config.server_url = trimmed;
        return Ok((config, false));
    }

    let config = ClientConfig::default();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_yaml::to_string(&config)?)?;
    Ok((config, true))
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}
