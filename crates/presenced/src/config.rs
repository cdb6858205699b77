use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where identities and attendance are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    /// Process memory only; everything is lost on restart.
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Backend::Sqlite),
            "memory" => Ok(Backend::Memory),
            other => Err(format!("unknown backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend: Backend,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Length of the embeddings produced by the upstream face descriptor.
    pub embedding_dim: usize,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// One attendance event per identity per this many seconds.
    pub dedup_window_secs: u64,
    pub bus: BusKind,
}

/// Optional overrides read from the file named by `PRESENCE_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    backend: Option<Backend>,
    db_path: Option<PathBuf>,
    embedding_dim: Option<usize>,
    match_threshold: Option<f32>,
    dedup_window_secs: Option<u64>,
    bus: Option<BusKind>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

impl Config {
    /// Load defaults, then the `PRESENCE_CONFIG` TOML file if set, then
    /// `PRESENCE_*` environment variables.
    pub fn load() -> Result<Self> {
        let file = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => FileConfig::default(),
        };
        let config = Self::resolve(file, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        Self {
            backend: env_parse(&env, "PRESENCE_BACKEND")
                .or(file.backend)
                .unwrap_or(Backend::Sqlite),
            db_path: env("PRESENCE_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("presence.db")),
            embedding_dim: env_parse(&env, "PRESENCE_EMBEDDING_DIM")
                .or(file.embedding_dim)
                .unwrap_or(128),
            match_threshold: env_parse(&env, "PRESENCE_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(0.6),
            dedup_window_secs: env_parse(&env, "PRESENCE_DEDUP_WINDOW_SECS")
                .or(file.dedup_window_secs)
                .unwrap_or(86_400),
            bus: env_parse(&env, "PRESENCE_BUS")
                .or(file.bus)
                .unwrap_or(BusKind::Session),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            bail!("embedding_dim must be positive");
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            bail!(
                "match_threshold must be a non-negative number, got {}",
                self.match_threshold
            );
        }
        if self.dedup_window_secs == 0 {
            bail!("dedup_window_secs must be positive");
        }
        self.dedup_window()?;
        Ok(())
    }

    pub fn dedup_window(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(std::time::Duration::from_secs(self.dedup_window_secs))
            .with_context(|| format!("dedup_window_secs {} out of range", self.dedup_window_secs))
    }
}

/// Parse an env override, ignoring (and logging) malformed values.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}
