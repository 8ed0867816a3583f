//! TOML configuration parsing and validation.
//!
//! See `config/crawl.example.toml` for a complete example. Stage programs,
//! arguments, and environment entries are forwarded to the external
//! executables without interpretation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResultsConfig {
    #[serde(default = "default_analytics_dir")]
    pub analytics_dir: PathBuf,
    #[serde(default = "default_aggregate_file")]
    pub aggregate_file: PathBuf,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            analytics_dir: default_analytics_dir(),
            aggregate_file: default_aggregate_file(),
        }
    }
}

fn default_analytics_dir() -> PathBuf {
    PathBuf::from("./public/analytics")
}
fn default_aggregate_file() -> PathBuf {
    PathBuf::from("./public/result/all_keywords_analysis.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub collector: StageCommand,
    pub analyzer: StageCommand,
    #[serde(default = "default_languages")]
    pub default_languages: Vec<String>,
    #[serde(default = "default_limits")]
    pub default_limits: BTreeMap<String, u32>,
}

fn default_languages() -> Vec<String> {
    vec![
        "python".to_string(),
        "java".to_string(),
        "javascript".to_string(),
    ]
}

fn default_limits() -> BTreeMap<String, u32> {
    BTreeMap::from([
        ("python".to_string(), 50),
        ("java".to_string(), 30),
        ("javascript".to_string(), 30),
    ])
}

/// How to launch one external stage.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StageCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment entries (credentials, limits) set on the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Names of variables copied from this process's environment.
    #[serde(default)]
    pub pass_env: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pipeline.collector.program.trim().is_empty() {
        anyhow::bail!("pipeline.collector.program must not be empty");
    }
    if config.pipeline.analyzer.program.trim().is_empty() {
        anyhow::bail!("pipeline.analyzer.program must not be empty");
    }

    for (lang, limit) in &config.pipeline.default_limits {
        if *limit == 0 {
            anyhow::bail!("pipeline.default_limits.{} must be > 0", lang);
        }
    }

    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    Ok(())
}
