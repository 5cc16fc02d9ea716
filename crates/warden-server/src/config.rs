use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_core::config::DispatchConfig;

pub const CONFIG_PATH_ENV: &str = "WARDEN_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Base URL agents use to reach this server; embedded in enrollment scripts.
    pub public_url: String,
    pub collaborator_token: Option<String>,
    pub database_path: Option<PathBuf>,
    pub dispatch: DispatchConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8420".to_string(),
            public_url: "http://127.0.0.1:8420".to_string(),
            collaborator_token: None,
            database_path: None,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Reads `path` when given, then applies `WARDEN_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind_addr) = lookup("WARDEN_BIND_ADDR") {
            self.bind_addr = bind_addr;
        }
        if let Some(public_url) = lookup("WARDEN_PUBLIC_URL") {
            self.public_url = public_url;
        }
        if let Some(token) = lookup("WARDEN_COLLABORATOR_TOKEN") {
            self.collaborator_token = Some(token).filter(|token| !token.is_empty());
        }
        if let Some(path) = lookup("WARDEN_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path)).filter(|path| !path.as_os_str().is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.public_url.starts_with("http://") || self.public_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "public_url '{}' must start with http:// or https://",
                self.public_url
            )));
        }
        self.dispatch
            .validate()
            .map_err(|error| ConfigError::Invalid(error.message))
    }

    /// WebSocket URL agents dial, derived from `public_url`.
    pub fn channel_url(&self) -> String {
        channel_url(&self.public_url)
    }
}

pub fn channel_url(public_url: &str) -> String {
    let base = public_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/agents/channel")
}

/// First CLI argument wins over `WARDEN_CONFIG`.
pub fn config_path(
    mut args: impl Iterator<Item = String>,
    env_value: Option<String>,
) -> Option<PathBuf> {
    args.next()
        .or(env_value)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use warden_core::models::ExecutionClass;

    use super::{ServerConfig, channel_url, config_path};

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
bind_addr = "0.0.0.0:9000"

[dispatch]
max_retries = 5

[dispatch.max_concurrent_per_class]
red = 1
"#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.dispatch.max_retries, 5);
        assert_eq!(config.dispatch.class_cap(ExecutionClass::Red), 1);
        assert_eq!(config.dispatch.class_cap(ExecutionClass::Blue), 4);
        assert_eq!(config.dispatch.heartbeat_interval_ms, 15_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ServerConfig::from_toml_str("bind = \"x\"").is_err());
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("WARDEN_PUBLIC_URL", "https://warden.example.org"),
            ("WARDEN_COLLABORATOR_TOKEN", "s3cret"),
        ]);
        let mut config = ServerConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));
        assert_eq!(config.public_url, "https://warden.example.org");
        assert_eq!(config.collaborator_token.as_deref(), Some("s3cret"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn channel_url_switches_scheme() {
        assert_eq!(
            channel_url("https://warden.example.org/"),
            "wss://warden.example.org/agents/channel"
        );
        assert_eq!(
            channel_url("http://127.0.0.1:8420"),
            "ws://127.0.0.1:8420/agents/channel"
        );
    }

    #[test]
    fn cli_argument_beats_environment() {
        let path = config_path(
            vec!["cli.toml".to_string()].into_iter(),
            Some("env.toml".to_string()),
        );
        assert_eq!(path.unwrap().to_str(), Some("cli.toml"));
        assert_eq!(
            config_path(std::iter::empty(), Some("env.toml".to_string()))
                .unwrap()
                .to_str(),
            Some("env.toml")
        );
        assert!(config_path(std::iter::empty(), None).is_none());
    }
}
