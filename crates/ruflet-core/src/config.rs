//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Ruflet configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Consecutive ports tried when the requested one is taken.
    #[serde(default = "default_max_bind_attempts")]
    pub max_bind_attempts: u32,

    /// WebSocket endpoint path.
    #[serde(default = "default_path")]
    pub path: String,

    /// Title assigned to every new page before the app runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_title: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            max_bind_attempts: default_max_bind_attempts(),
            path: default_path(),
            app_title: None,
        }
    }
}

fn default_port() -> u16 {
    8550
}

fn default_max_bind_attempts() -> u32 {
    100
}

fn default_path() -> String {
    "/ws".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "ruflet_server=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| crate::error::RufletError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn server_host(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.host.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn server_port(&self) -> u16 {
        self.server.as_ref().map(|s| s.port).unwrap_or_else(default_port)
    }

    pub fn max_bind_attempts(&self) -> u32 {
        self.server
            .as_ref()
            .map(|s| s.max_bind_attempts)
            .unwrap_or_else(default_max_bind_attempts)
    }

    pub fn ws_path(&self) -> String {
        self.server
            .as_ref()
            .map(|s| s.path.clone())
            .unwrap_or_else(default_path)
    }

    pub fn app_title(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.app_title.clone())
            .unwrap_or_else(|| "Ruflet App".to_string())
    }

    pub fn log_format(&self) -> &str {
        self.logging.as_ref().map(|l| l.format.as_str()).unwrap_or("plain")
    }

    /// Apply CLI overrides on top of the file values.
    pub fn with_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if host.is_none() && port.is_none() {
            return self;
        }
        let server = self.server.get_or_insert_with(ServerConfig::default);
        if let Some(host) = host {
            server.host = Some(host);
        }
        if let Some(port) = port {
            server.port = port;
        }
        self
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(server) = &self.server {
            if server.port == 0 {
                errors.push("Server port cannot be 0".to_string());
            }
            if !server.path.starts_with('/') {
                errors.push(format!("Server path must start with '/': {:?}", server.path));
            }
            if server.max_bind_attempts == 0 {
                warnings.push("max_bind_attempts is 0; using a single attempt".to_string());
            }
        }

        if let Some(logging) = &self.logging {
            if logging.format != "plain" && logging.format != "json" {
                warnings.push(format!("Unknown log format '{}', using plain", logging.format));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Ruflet data: `~/.ruflet/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ruflet")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server_host(), "0.0.0.0");
        assert_eq!(config.server_port(), 8550);
        assert_eq!(config.max_bind_attempts(), 100);
        assert_eq!(config.ws_path(), "/ws");
        assert_eq!(config.app_title(), "Ruflet App");
        assert_eq!(config.log_format(), "plain");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert!(config.server.is_none());
    }

    #[test]
    fn test_load_json5_with_env() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_RUFLET_TITLE", "Counter") };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in JSON5
                server: { port: 9000, app_title: "${TEST_RUFLET_TITLE}" },
                logging: { format: "json" },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server_port(), 9000);
        assert_eq!(config.ws_path(), "/ws");
        assert_eq!(config.app_title(), "Counter");
        assert_eq!(config.log_format(), "json");
        unsafe { std::env::remove_var("TEST_RUFLET_TITLE") };
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ server: ").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(crate::error::RufletError::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let config = Config::default().with_overrides(Some("127.0.0.1".into()), Some(9100));
        assert_eq!(config.server_host(), "127.0.0.1");
        assert_eq!(config.server_port(), 9100);
    }

    #[test]
    fn test_validate() {
        let config = Config {
            server: Some(ServerConfig {
                port: 0,
                path: "ws".into(),
                ..Default::default()
            }),
            logging: None,
        };
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 2);
    }
}
