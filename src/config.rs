// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Context;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dispatcher::DEFAULT_MAX_INCONSISTENCY_REPORTS;

const CONFIG_FILE: &str = "scx_rqtrace.toml";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Tracing filter, in `EnvFilter` syntax.
    log_level: Option<String>,
    /// Number of trace inconsistencies logged before only counting them.
    max_inconsistency_reports: Option<usize>,
    /// Skip unparsable trace lines instead of failing.
    skip_malformed: Option<bool>,
}

pub fn get_config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("scx_rqtrace")?;
    let config_path = xdg_dirs.get_config_file(CONFIG_FILE);
    Ok(config_path)
}

impl Config {
    /// Tracing filter.
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn set_log_level(&mut self, log_level: String) {
        self.log_level = Some(log_level);
    }

    /// Number of trace inconsistencies logged before only counting them.
    pub fn max_inconsistency_reports(&self) -> usize {
        self.max_inconsistency_reports
            .unwrap_or(DEFAULT_MAX_INCONSISTENCY_REPORTS)
    }

    pub fn set_max_inconsistency_reports(&mut self, max: usize) {
        self.max_inconsistency_reports = Some(max);
    }

    /// Skip unparsable trace lines instead of failing.
    pub fn skip_malformed(&self) -> bool {
        self.skip_malformed.unwrap_or(false)
    }

    pub fn set_skip_malformed(&mut self, skip: bool) {
        self.skip_malformed = Some(skip);
    }

    /// Loads the config at `path`.
    pub fn load_from(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise the XDG config file if it exists,
    /// otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        if let Some(path) = path {
            return Self::load_from(path);
        }
        let default_path = get_config_path()?;
        if default_path.exists() {
            Self::load_from(&default_path)
        } else {
            Ok(Config::default())
        }
    }

    /// Writes the config to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = toml::to_string(&self)?;
        fs::write(path, config_str)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }
}
