use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Concurrent units per job.
    #[serde(default = "default_per_job_units")]
    pub per_job_units: usize,
    /// Concurrent units across all jobs; bounds total child-process fan-out.
    #[serde(default = "default_max_total_units")]
    pub max_total_units: usize,
    #[serde(default = "default_tool_timeout")]
    pub default_tool_timeout_secs: u64,
    /// Whole-job timeout applied when the request does not set one.
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:5050".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/scanhive")
}
fn default_per_job_units() -> usize {
    4
}
fn default_max_total_units() -> usize {
    16
}
fn default_tool_timeout() -> u64 {
    3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            per_job_units: default_per_job_units(),
            max_total_units: default_max_total_units(),
            default_tool_timeout_secs: default_tool_timeout(),
            job_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Main daemon log file; stdout only when unset.
    pub output: Option<PathBuf>,
    /// Separate sink for raw tool output.
    pub job_output: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            job_output: None,
        }
    }
}

/// Optional external catalog files overriding the built-in tool set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub tools_file: Option<PathBuf>,
    pub profiles_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow::anyhow!(
                "Unsupported config file format. Use .yaml, .yml, or .toml"
            )),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.server.data_dir.join("scanhive.db")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.server.data_dir.join("jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.server.per_job_units > 0);
        assert!(config.server.max_total_units >= config.server.per_job_units);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn loads_partial_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  bind_addr: \"0.0.0.0:9000\"\n  per_job_units: 2"
        )
        .unwrap();
        let config = Config::from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.server.per_job_units, 2);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.server.max_total_units, 16);
    }

    #[test]
    fn rejects_unknown_extension() {
        assert!(Config::from_file(&PathBuf::from("config.ini")).is_err());
    }
}
