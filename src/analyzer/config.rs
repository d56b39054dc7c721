//! Analyzer configuration: one uniquely-named external command plus the
//! globs and optional shaper that govern how its output is consumed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AnalyzerConfig {
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub globs: Vec<String>,
    #[serde(default)]
    pub shaper: Option<String>,
    #[serde(default, rename = "stdout")]
    pub stdout_path: Option<PathBuf>,
    #[serde(default, rename = "stderr")]
    pub stderr_path: Option<PathBuf>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub disabled: bool,
}

impl AnalyzerConfig {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "analyzer name must not be empty".to_string(),
            ));
        }
        if self.cmd.trim().is_empty() {
            return Err(CoreError::InvalidConfig(format!(
                "analyzer {:?}: cmd must not be empty",
                self.name
            )));
        }
        Ok(())
    }
}

/// Drop disabled analyzers and validate the remainder: each enabled
/// config must have a non-empty name and command, and names must be
/// unique within the run.
pub fn active_configs(configs: Vec<AnalyzerConfig>) -> Result<Vec<AnalyzerConfig>> {
    let enabled: Vec<AnalyzerConfig> = configs.into_iter().filter(|c| !c.disabled).collect();
    let mut seen = std::collections::HashSet::new();
    for conf in &enabled {
        conf.validate()?;
        if !seen.insert(conf.name.clone()) {
            return Err(CoreError::InvalidConfig(format!(
                "duplicate analyzer name {:?}",
                conf.name
            )));
        }
    }
    Ok(enabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(name: &str, cmd: &str) -> AnalyzerConfig {
        AnalyzerConfig {
            name: name.to_string(),
            cmd: cmd.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_empty_name() {
        let err = active_configs(vec![conf("", "zeek")]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_empty_cmd() {
        let err = active_configs(vec![conf("zeek", "")]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = active_configs(vec![conf("a", "zeek"), conf("a", "suricata")]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn filters_disabled_analyzers() {
        let mut disabled = conf("a", "zeek");
        disabled.disabled = true;
        let active = active_configs(vec![disabled, conf("b", "suricata")]).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "b");
    }
}
