//! YAML configuration loading for the root path and the set of analyzers
//! to fan a capture out to.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::analyzer::config::AnalyzerConfig;
use crate::error::Result;

/// The top-level configuration file shape: `{root: <path>?, analyzers:
/// [...]}`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RootConfig {
    #[serde(default, rename = "root")]
    pub root_path: Option<PathBuf>,
    #[serde(default)]
    pub analyzers: Vec<AnalyzerConfig>,
}

impl RootConfig {
    /// Parses a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config = serde_yaml::from_str(text)
            .map_err(|e| crate::error::CoreError::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    /// Loads and parses a configuration file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// A sane zero-config default: one Zeek-style line-JSON analyzer and
    /// one Suricata-style EVE-JSON analyzer with a shaper attached,
    /// matching the shape of a real deployment without requiring a
    /// configuration file for a quick first run.
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            root_path: None,
            analyzers: vec![
                AnalyzerConfig {
                    name: "zeek".to_string(),
                    cmd: "zeek".to_string(),
                    args: vec!["-C".to_string(), "-r".to_string(), "-".to_string()],
                    globs: vec!["*.log".to_string()],
                    shaper: None,
                    stdout_path: None,
                    stderr_path: None,
                    work_dir: None,
                    disabled: false,
                },
                AnalyzerConfig {
                    name: "suricata".to_string(),
                    cmd: "suricata".to_string(),
                    args: vec![
                        "-r".to_string(),
                        "/dev/stdin".to_string(),
                        "-l".to_string(),
                        ".".to_string(),
                    ],
                    globs: vec!["eve.json".to_string()],
                    shaper: Some("suricata-eve".to_string()),
                    stdout_path: None,
                    stderr_path: None,
                    work_dir: None,
                    disabled: false,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let yaml = "root: /var/lib/pcapfan\nanalyzers:\n  - name: zeek\n    cmd: zeek\n";
        let config = RootConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.analyzers.len(), 1);
        assert_eq!(config.analyzers[0].name, "zeek");
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = RootConfig::from_yaml("not: [valid").unwrap_err();
        assert!(matches!(err, crate::error::CoreError::InvalidConfig(_)));
    }

    #[test]
    fn default_config_has_two_analyzers() {
        let config = RootConfig::default_config();
        assert_eq!(config.analyzers.len(), 2);
        assert!(config.analyzers.iter().any(|a| a.shaper.is_some()));
    }
}
