use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::read_to_string;

use crate::{
    bench::Bench,
    configuration::Configuration,
    matrix::TrialMatrix,
    runner::CommandSpec,
    util::{deserialize_block_sizes, flag},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration `{0}`")]
    UnknownConfiguration(String),
    #[error("invalid block size `{0}`")]
    InvalidBlockSize(String),
    #[error("no {0} given")]
    Empty(&'static str),
    #[error("{kind} `{value}` listed more than once")]
    Duplicate { kind: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("reading {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing campaign config")]
    Parse(#[from] serde_yml::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub settings: Settings,
    pub configurations: Vec<Configuration>,
    #[serde(deserialize_with = "deserialize_block_sizes")]
    pub block_sizes: Vec<u64>,
    pub bench: Box<dyn Bench>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub runs_per_config: u32,
    /// Seconds before a reset or benchmark invocation is killed
    pub trial_timeout: Option<u64>,
    /// Extra variables overlaid on the environment of every invocation
    pub env: Option<HashMap<String, String>>,
    pub reset: ResetSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Defaults to populating persistent memory only for pmem backends
    pub pmem_populate: Option<bool>,
    #[serde(default)]
    pub cache: bool,
}

impl ResetSettings {
    /// `<program> <args..> <run> <configuration id> <pmem populate> <cache>`
    pub fn cmd(&self, configuration: Configuration, env: &HashMap<String, String>) -> CommandSpec {
        let pmem_populate = self
            .pmem_populate
            .unwrap_or_else(|| configuration.uses_pmem());
        let mut args = self.args.clone();
        args.extend([
            flag(true),
            configuration.id().to_string(),
            flag(pmem_populate),
            flag(self.cache),
        ]);
        CommandSpec {
            program: self.program.clone(),
            args,
            env: env.clone(),
        }
    }
}

impl Settings {
    pub fn trial_timeout(&self) -> Option<Duration> {
        self.trial_timeout.map(Duration::from_secs)
    }

    pub fn env(&self) -> HashMap<String, String> {
        self.env.clone().unwrap_or_default()
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.configurations.is_empty() {
            return Err(ConfigError::Empty("configurations"));
        }
        if self.block_sizes.is_empty() {
            return Err(ConfigError::Empty("block sizes"));
        }
        if self.settings.runs_per_config == 0 {
            return Err(ConfigError::Zero("runs_per_config"));
        }
        if self.settings.trial_timeout == Some(0) {
            return Err(ConfigError::Zero("trial_timeout"));
        }

        let mut seen = HashSet::new();
        for c in &self.configurations {
            if !seen.insert(*c) {
                return Err(ConfigError::Duplicate {
                    kind: "configuration",
                    value: c.to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        for bs in &self.block_sizes {
            if *bs == 0 {
                return Err(ConfigError::Zero("block size"));
            }
            if !seen.insert(*bs) {
                return Err(ConfigError::Duplicate {
                    kind: "block size",
                    value: bs.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn matrix(&self) -> TrialMatrix {
        TrialMatrix::new(
            self.configurations.clone(),
            self.block_sizes.clone(),
            self.settings.runs_per_config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::tests::EchoBench;

    fn config_yaml(configurations: &str, block_sizes: &str, runs: u32) -> String {
        format!(
            r#"
name: test
configurations: {configurations}
block_sizes: {block_sizes}
settings:
  runs_per_config: {runs}
  reset:
    program: sh
    args: ["-c", "true"]
bench:
  type: echo
  output: "Bandwidth (MB/sec): 1.0\nAverage IOPS: 2.0"
"#
        )
    }

    #[test]
    fn parses_full_config() {
        let config = Config::parse(&config_yaml("[1, 3]", "[64, 4k, 4M]", 2)).unwrap();
        assert_eq!(
            config.configurations,
            vec![Configuration::Rocks, Configuration::RocksPmem]
        );
        assert_eq!(config.block_sizes, vec![64, 4096, 4 * 1024 * 1024]);
        assert_eq!(config.settings.runs_per_config, 2);
        assert!(config.bench.downcast_ref::<EchoBench>().is_some());
    }

    #[test]
    fn rejects_unknown_configuration() {
        assert!(Config::parse(&config_yaml("[1, 7]", "[64]", 1)).is_err());
    }

    #[test]
    fn rejects_malformed_parameter_sets() {
        assert!(matches!(
            Config::parse(&config_yaml("[]", "[64]", 1)),
            Err(ConfigError::Empty(_))
        ));
        assert!(matches!(
            Config::parse(&config_yaml("[1]", "[64, 64]", 1)),
            Err(ConfigError::Duplicate { .. })
        ));
        assert!(matches!(
            Config::parse(&config_yaml("[2, 2]", "[64]", 1)),
            Err(ConfigError::Duplicate { .. })
        ));
        assert!(matches!(
            Config::parse(&config_yaml("[1]", "[0]", 1)),
            Err(ConfigError::Zero(_))
        ));
        assert!(matches!(
            Config::parse(&config_yaml("[1]", "[64]", 0)),
            Err(ConfigError::Zero(_))
        ));
        assert!(Config::parse(&config_yaml("[1]", "[4x]", 1)).is_err());
    }

    #[test]
    fn reset_command_carries_positional_flags() {
        let reset = ResetSettings {
            program: "bash".to_owned(),
            args: vec!["script/reset.sh".to_owned()],
            pmem_populate: None,
            cache: true,
        };
        let env = HashMap::new();
        assert_eq!(
            reset.cmd(Configuration::Procks, &env).args,
            vec!["script/reset.sh", "1", "2", "0", "1"]
        );
        assert_eq!(
            reset.cmd(Configuration::ProcksPmem, &env).args,
            vec!["script/reset.sh", "1", "4", "1", "1"]
        );
    }
}
