use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid command line: '{0}'")]
    InvalidCommand(String),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),
}

/// A program plus its arguments, parsed from a single whitespace-separated
/// string such as `"npm install"`. Quoting is not supported; provisioning
/// commands are simple by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let mut parts = line.split_whitespace().map(str::to_owned);
        let program = parts
            .next()
            .ok_or_else(|| ConfigError::InvalidCommand(line.to_owned()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Tunables for the provisioning pipeline and the change bridge.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Dependency install command, run to completion before the server.
    pub install: CommandLine,
    /// Dev server command, expected to keep running once ready.
    pub start: CommandLine,
    /// File whose appearance marks the runtime filesystem as populated.
    pub manifest_path: String,
    /// Poll cadence while waiting for the manifest to appear.
    pub poll_interval: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            install: CommandLine {
                program: "npm".to_owned(),
                args: vec!["install".to_owned()],
            },
            start: CommandLine {
                program: "npm".to_owned(),
                args: vec!["run".to_owned(), "start".to_owned()],
            },
            manifest_path: "/package.json".to_owned(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    install: Option<String>,
    start: Option<String>,
    manifest_path: Option<String>,
    poll_interval_ms: Option<u64>,
}

/// Parse a TOML config string, falling back to defaults for absent keys.
pub fn parse_config_str(raw: &str) -> Result<ProvisionConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(raw)?;
    let mut config = ProvisionConfig::default();
    if let Some(line) = raw.install {
        config.install = CommandLine::parse(&line)?;
    }
    if let Some(line) = raw.start {
        config.start = CommandLine::parse(&line)?;
    }
    if let Some(path) = raw.manifest_path {
        config.manifest_path = path;
    }
    if let Some(ms) = raw.poll_interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }
    debug!(install = %config.install, start = %config.start, "config loaded");
    Ok(config)
}

pub fn parse_config_file(path: &Path) -> Result<ProvisionConfig, ConfigError> {
    parse_config_str(&std::fs::read_to_string(path)?)
}
