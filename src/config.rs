//! Configuration file support for kvcell
//!
//! Loads settings from `kvcell.toml` (or `$KVCELL_CONFIG`).
//! CLI arguments override config file values.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::backend::DType;

/// How far `shift` may renumber a sequence's positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftMode {
    /// The model cannot renumber positions at all
    Disabled,
    /// Renumbering is allowed only if the sequence stays gap-free
    Contiguous,
    /// Any collision-free, non-negative renumbering
    Arbitrary,
}

impl fmt::Display for ShiftMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShiftMode::Disabled => write!(f, "disabled"),
            ShiftMode::Contiguous => write!(f, "contiguous"),
            ShiftMode::Arbitrary => write!(f, "arbitrary"),
        }
    }
}

impl FromStr for ShiftMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "none" | "off" => Ok(ShiftMode::Disabled),
            "contiguous" => Ok(ShiftMode::Contiguous),
            "arbitrary" | "any" => Ok(ShiftMode::Arbitrary),
            other => Err(format!("unknown shift mode '{}'", other)),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub cache: CacheConfig,
    pub workload: WorkloadConfig,
}

/// Cache geometry and behaviour
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of cells (token slots shared by all sequences)
    pub capacity: usize,
    pub n_layers: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    /// Storage type of the per-layer arenas
    pub dtype: DType,
    pub shift_mode: ShiftMode,
}

impl CacheConfig {
    /// Elements of one key (or value) slot: heads × head_dim
    pub fn slot_elems(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Arena bytes once every layer has been touched (keys + values)
    pub fn arena_bytes(&self) -> usize {
        self.capacity * self.slot_elems() * self.dtype.size_bytes() * 2 * self.n_layers
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 2048,
            n_layers: 4,
            n_kv_heads: 4,
            head_dim: 64,
            dtype: DType::F32,
            shift_mode: ShiftMode::Arbitrary,
        }
    }
}

/// Parameters of the scripted decode workload
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Concurrent sequences at start
    pub sequences: usize,
    /// Decode steps to run
    pub steps: usize,
    /// Prompt tokens prefilled per sequence before decoding
    pub prefill: usize,
    /// Fork the first sequence every N steps (0 = never)
    pub fork_every: usize,
    /// Keep at most this many tokens per sequence (0 = unlimited)
    pub window: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            sequences: 4,
            steps: 64,
            prefill: 8,
            fork_every: 16,
            window: 0,
        }
    }
}

impl Config {
    /// Load config from default locations, falling back to defaults
    pub fn load() -> Result<Self> {
        let config_path = if let Ok(path) = std::env::var("KVCELL_CONFIG") {
            Some(PathBuf::from(path))
        } else {
            Self::find_config_file()
        };

        match config_path {
            Some(path) if path.exists() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Find config file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = vec![PathBuf::from("kvcell.toml")];
        if let Some(dir) = dirs_config() {
            candidates.push(dir.join("kvcell.toml"));
        }
        candidates.into_iter().find(|c| c.exists())
    }

    /// Load and parse a TOML config file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse `[section]` / `key = value` content into a Config
    fn parse_toml(content: &str) -> Result<Self> {
        let mut config = Self::default();
        let kv_map = parse_toml_simple(content);

        for (key, value) in &kv_map {
            match key.as_str() {
                "cache.capacity" => config.cache.capacity = parse_num(key, value)?,
                "cache.n_layers" => config.cache.n_layers = parse_num(key, value)?,
                "cache.n_kv_heads" => config.cache.n_kv_heads = parse_num(key, value)?,
                "cache.head_dim" => config.cache.head_dim = parse_num(key, value)?,
                "cache.dtype" => {
                    config.cache.dtype = value.parse().map_err(|e| anyhow!("{}: {}", key, e))?;
                }
                "cache.shift_mode" => {
                    config.cache.shift_mode =
                        value.parse().map_err(|e| anyhow!("{}: {}", key, e))?;
                }
                "workload.sequences" => config.workload.sequences = parse_num(key, value)?,
                "workload.steps" => config.workload.steps = parse_num(key, value)?,
                "workload.prefill" => config.workload.prefill = parse_num(key, value)?,
                "workload.fork_every" => config.workload.fork_every = parse_num(key, value)?,
                "workload.window" => config.workload.window = parse_num(key, value)?,
                _ => {} // ignore unknown keys
            }
        }

        if config.cache.capacity == 0 {
            anyhow::bail!("cache.capacity must be greater than zero");
        }
        Ok(config)
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        r#"# kvcell configuration file

[cache]
capacity = 2048
n_layers = 4
n_kv_heads = 4
head_dim = 64
# f32 or f16
dtype = "f32"
# disabled, contiguous or arbitrary
shift_mode = "arbitrary"

[workload]
sequences = 4
steps = 64
prefill = 8
fork_every = 16
# 0 keeps the whole history
window = 0
"#
        .to_string()
    }
}

fn parse_num(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .with_context(|| format!("{} expects an unsigned integer, got '{}'", key, value))
}

/// Simple TOML reader: handles `[section]` headers and `key = value` pairs
fn parse_toml_simple(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut section = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].trim().to_string();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            let full_key = if section.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", section, key)
            };
            map.insert(full_key, value.to_string());
        }
    }
    map
}

/// Get platform config directory
fn dirs_config() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config").join("kvcell"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(|d| PathBuf::from(d).join("kvcell"))
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config").join("kvcell"))
            })
    }
}
