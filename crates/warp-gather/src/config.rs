//! warp-gather.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use warpgrid_gather::GathererOptions;
use warpgrid_gather::options::parse_duration;

/// Gather loop period when a gatherer sets none.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-call deadline when a gatherer sets none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatherConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub gatherers: Vec<GathererConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Plugin modules, loaded in order before any gatherer is built.
    #[serde(default)]
    pub plugins: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GathererConfig {
    /// Autoscaler name; used as log context.
    pub name: String,
    /// Registry name of the gatherer kind.
    pub kind: String,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    /// Handed to the gatherer factory untouched.
    #[serde(default)]
    pub options: GathererOptions,
}

impl GatherConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: GatherConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate gatherer names and unparseable durations.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for g in &self.gatherers {
            if g.name.is_empty() {
                bail!("gatherer of kind `{}` has an empty name", g.kind);
            }
            if !names.insert(g.name.as_str()) {
                bail!("duplicate gatherer name `{}`", g.name);
            }
            g.interval()?;
            g.timeout()?;
        }
        Ok(())
    }
}

impl GathererConfig {
    pub fn interval(&self) -> anyhow::Result<Duration> {
        duration_field(&self.name, "interval", self.interval.as_deref(), DEFAULT_INTERVAL)
    }

    pub fn timeout(&self) -> anyhow::Result<Duration> {
        duration_field(&self.name, "timeout", self.timeout.as_deref(), DEFAULT_TIMEOUT)
    }
}

fn duration_field(
    gatherer: &str,
    field: &str,
    value: Option<&str>,
    default: Duration,
) -> anyhow::Result<Duration> {
    let Some(value) = value else {
        return Ok(default);
    };
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => bail!("gatherer `{gatherer}`: invalid {field} {value:?}"),
    }
}
