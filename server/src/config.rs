//! Startup configuration read from a `key=value` properties file.
//!
//! The resulting [`Config`] is built once and handed to the server by value;
//! nothing reads settings from global state afterwards.

use log::debug;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "./file-server.properties";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_SESSION_BACKLOG: usize = 64;
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_MAX_SESSIONS: usize = 1024;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read properties file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected key=value, got {text:?}")]
    Malformed { line: usize, text: String },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Client revision accepted during the handshake
    pub revision: u32,
    pub host: String,
    pub port: u16,
    /// Worker pool size
    pub threads: usize,
    pub cache_path: PathBuf,
    /// Values written after the handshake success byte; derived from the
    /// archive when empty
    pub prefetch_keys: Vec<u32>,
    /// Outstanding requests allowed per session before its reads stall
    pub session_backlog: usize,
    /// Requests allowed in the shared queue across all sessions
    pub queue_capacity: usize,
    pub max_sessions: usize,
    /// How long a session may spend on one handshake step before it is closed
    pub handshake_timeout: Duration,
}

impl Config {
    /// Creates a configuration with defaults for everything but the required settings.
    pub fn new(revision: u32, port: u16, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            revision,
            host: DEFAULT_HOST.to_string(),
            port,
            threads: default_threads(),
            cache_path: cache_path.into(),
            prefetch_keys: Vec::new(),
            session_backlog: DEFAULT_SESSION_BACKLOG,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_sessions: DEFAULT_MAX_SESSIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut revision = None;
        let mut port = None;
        let mut cache_path = None;
        let mut threads = None;
        let mut host = None;
        let mut prefetch_keys = Vec::new();
        let mut session_backlog = DEFAULT_SESSION_BACKLOG;
        let mut queue_capacity = DEFAULT_QUEUE_CAPACITY;
        let mut max_sessions = DEFAULT_MAX_SESSIONS;
        let mut handshake_timeout = DEFAULT_HANDSHAKE_TIMEOUT;

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Malformed {
                line: number + 1,
                text: line.to_string(),
            })?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "revision" => revision = Some(parse_value(key, value)?),
                "port" => port = Some(parse_value(key, value)?),
                "threads" => threads = Some(parse_positive(key, value)?),
                "cachePath" => cache_path = Some(PathBuf::from(value)),
                "host" => host = Some(value.to_string()),
                "prefetchKeys" => prefetch_keys = parse_keys(value)?,
                "sessionBacklog" => session_backlog = parse_positive(key, value)?,
                "queueCapacity" => queue_capacity = parse_positive(key, value)?,
                "maxSessions" => max_sessions = parse_positive(key, value)?,
                "handshakeTimeout" => {
                    handshake_timeout = Duration::from_secs(parse_positive(key, value)? as u64)
                }
                // Version table signing lives with the archive engine.
                "rsaModulus" | "rsaPrivate" => debug!("Ignoring {}", key),
                _ => debug!("Ignoring unknown setting {}", key),
            }
        }

        Ok(Self {
            revision: revision.ok_or(ConfigError::Missing("revision"))?,
            host: host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: port.ok_or(ConfigError::Missing("port"))?,
            threads: threads.unwrap_or_else(default_threads),
            cache_path: cache_path.ok_or(ConfigError::Missing("cachePath"))?,
            prefetch_keys,
            session_backlog,
            queue_capacity,
            max_sessions,
            handshake_timeout,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    let parsed: usize = parse_value(key, value)?;
    if parsed == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

fn parse_keys(value: &str) -> Result<Vec<u32>, ConfigError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value
        .split(',')
        .map(|key| parse_value("prefetchKeys", key.trim()))
        .collect()
}
