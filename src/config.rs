// Configuration file parsing for ML projects (ml.toml).

use crate::analyzer::AnalysisOptions;
use crate::diagnostics::Severity;
use crate::sandbox::SandboxConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main ML project configuration (ml.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MlConfig {
    #[serde(default)]
    pub sandbox: SandboxSection,

    #[serde(default)]
    pub policy: PolicySection,

    #[serde(default)]
    pub analysis: AnalysisSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxSection {
    pub cpu_time_limit_s: Option<u64>,
    pub wall_time_limit_s: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub max_open_files: Option<u64>,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    #[serde(default)]
    pub filesystem_roots: Vec<PathBuf>,
    pub interpreter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicySection {
    /// Policy files whose applicable grants are unioned.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Principal the program runs as; defaults to `*`.
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisSection {
    /// Findings at or above this severity abort compilation
    /// (`info`/`low`/`medium`/`high`/`critical`).
    pub abort_threshold: Option<String>,
    pub pass_timeout_s: Option<u64>,
}

impl MlConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Look for `ml.toml` next to the input file, then in ancestor
    /// directories.
    pub fn discover(input: &Path) -> Option<(PathBuf, Self)> {
        let start = input.parent().unwrap_or(Path::new("."));
        let mut dir = Some(start);
        while let Some(current) = dir {
            let candidate = current.join("ml.toml");
            if candidate.is_file() {
                return MlConfig::load_from_file(&candidate)
                    .ok()
                    .map(|config| (candidate, config));
            }
            dir = current.parent();
        }
        None
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::default();
        if let Some(seconds) = self.sandbox.cpu_time_limit_s {
            config.cpu_time_limit = Duration::from_secs(seconds);
        }
        if let Some(seconds) = self.sandbox.wall_time_limit_s {
            config.wall_time_limit = Duration::from_secs(seconds);
        }
        if let Some(mb) = self.sandbox.memory_limit_mb {
            config.memory_limit_bytes = mb * 1024 * 1024;
        }
        if let Some(files) = self.sandbox.max_open_files {
            config.max_open_files = files;
        }
        config.network_allowed = self.sandbox.network;
        if !self.sandbox.env_allowlist.is_empty() {
            config.env_allowlist = self.sandbox.env_allowlist.clone();
        }
        config.filesystem_roots = self.sandbox.filesystem_roots.clone();
        if let Some(interpreter) = &self.sandbox.interpreter {
            config.interpreter = interpreter.clone();
        }
        config
    }

    pub fn analysis_options(&self) -> AnalysisOptions {
        let mut options = AnalysisOptions::default();
        if let Some(threshold) = &self.analysis.abort_threshold {
            if let Ok(severity) = threshold.parse::<Severity>() {
                options.abort_threshold = severity;
            }
        }
        if let Some(seconds) = self.analysis.pass_timeout_s {
            options.pass_timeout = Duration::from_secs(seconds);
        }
        options
    }

    pub fn principal(&self) -> &str {
        self.policy.principal.as_deref().unwrap_or("*")
    }
}
