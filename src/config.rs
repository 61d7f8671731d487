use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ServeError};

/// Startup configuration for the serving endpoint.
///
/// Read once before anything is loaded and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    /// Address of the inference interface, `ip:port`
    #[serde(default = "default_inference_address")]
    pub inference_address: String,
    /// Address of the management interface, `ip:port`
    #[serde(default = "default_management_address")]
    pub management_address: String,
    /// Directory holding the model archives
    pub model_store: PathBuf,
    /// Optional requirements file resolved before any model loads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_manifest: Option<PathBuf>,
    #[serde(default = "default_workers")]
    pub default_workers_per_model: usize,
    #[serde(default = "default_response_timeout")]
    pub default_response_timeout_secs: u64,
    #[serde(default = "default_management_timeout")]
    pub management_timeout_secs: u64,
    /// Largest accepted request body, in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Model name to archive mapping
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A model declaration: either a bare archive name or a table of settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelEntry {
    Archive(String),
    Detailed(ModelSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub archive: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// A required model that fails to load aborts startup
    #[serde(default = "default_required")]
    pub required: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Fully resolved settings for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub archive: String,
    pub workers: usize,
    pub timeout: Duration,
    pub required: bool,
}

fn default_inference_address() -> String {
    "0.0.0.0:8085".to_string()
}

fn default_management_address() -> String {
    "0.0.0.0:8086".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_response_timeout() -> u64 {
    120
}

fn default_management_timeout() -> u64 {
    300
}

fn default_max_request_size() -> usize {
    6_553_500
}

fn default_required() -> bool {
    true
}

impl Default for ServingConfig {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "llama2-7b-chat".to_string(),
            ModelEntry::Archive("llama2-7b-chat.mar".to_string()),
        );

        Self {
            inference_address: default_inference_address(),
            management_address: default_management_address(),
            model_store: PathBuf::from("/home/model-server/model_store"),
            dependency_manifest: None,
            default_workers_per_model: default_workers(),
            default_response_timeout_secs: default_response_timeout(),
            management_timeout_secs: default_management_timeout(),
            max_request_size: default_max_request_size(),
            models,
            logging: LoggingConfig::default(),
        }
    }
}

impl ModelEntry {
    pub fn settings(&self) -> ModelSettings {
        match self {
            ModelEntry::Archive(archive) => ModelSettings {
                archive: archive.clone(),
                workers: None,
                timeout_secs: None,
                required: true,
            },
            ModelEntry::Detailed(settings) => settings.clone(),
        }
    }
}

impl ServingConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            ServeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config = Self::from_toml(&content)?;
        tracing::info!(models = config.models.len(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ServingConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn inference_addr(&self) -> Result<SocketAddr> {
        parse_addr("inference_address", &self.inference_address)
    }

    pub fn management_addr(&self) -> Result<SocketAddr> {
        parse_addr("management_address", &self.management_address)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.default_response_timeout_secs)
    }

    pub fn management_timeout(&self) -> Duration {
        Duration::from_secs(self.management_timeout_secs)
    }

    /// Resolve every declared model against the configured defaults.
    pub fn model_specs(&self) -> Vec<ModelSpec> {
        self.models
            .iter()
            .map(|(name, entry)| {
                self.spec_for(name, &entry.settings())
            })
            .collect()
    }

    /// Build a spec for a model registered at runtime.
    pub fn spec_for(&self, name: &str, settings: &ModelSettings) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            archive: settings.archive.clone(),
            workers: settings.workers.unwrap_or(self.default_workers_per_model),
            timeout: Duration::from_secs(
                settings
                    .timeout_secs
                    .unwrap_or(self.default_response_timeout_secs),
            ),
            required: settings.required,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let inference = self.inference_addr()?;
        let management = self.management_addr()?;
        if inference.port() != 0 && inference == management {
            return Err(ServeError::Config(
                "inference_address and management_address must differ".into(),
            ));
        }

        if self.model_store.as_os_str().is_empty() {
            return Err(ServeError::Config("model_store must be set".into()));
        }

        if self.default_workers_per_model == 0 {
            return Err(ServeError::Config(
                "default_workers_per_model must be at least 1".into(),
            ));
        }

        if self.default_response_timeout_secs == 0 || self.management_timeout_secs == 0 {
            return Err(ServeError::Config("timeouts must be at least 1 second".into()));
        }

        if self.max_request_size == 0 {
            return Err(ServeError::Config("max_request_size must be positive".into()));
        }

        for (name, entry) in &self.models {
            let settings = entry.settings();
            validate_model_name(name)?;
            validate_archive_name(&settings.archive)?;
            if settings.workers == Some(0) {
                return Err(ServeError::Config(format!(
                    "model '{}': workers must be at least 1",
                    name
                )));
            }
            if settings.timeout_secs == Some(0) {
                return Err(ServeError::Config(format!(
                    "model '{}': timeout_secs must be at least 1",
                    name
                )));
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ServeError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            _ => {
                return Err(ServeError::Config(
                    "log format must be 'pretty' or 'json'".into(),
                ))
            }
        }

        Ok(())
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| ServeError::Config(format!("invalid {} '{}': {}", field, value, e)))
}

/// Model names appear in URL paths, so keep them to a safe alphabet.
pub fn validate_model_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(ServeError::Config(format!(
            "invalid model name '{}': use letters, digits, '-', '_' or '.'",
            name
        )));
    }
    Ok(())
}

/// Archives are looked up inside the model store and must not escape it.
pub fn validate_archive_name(archive: &str) -> Result<()> {
    let path = Path::new(archive);
    let contained = !archive.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !contained {
        return Err(ServeError::Config(format!(
            "invalid archive '{}': must be a relative path inside the model store",
            archive
        )));
    }
    Ok(())
}

/// Parse a `--models` argument: `name=archive`, or a bare `name` meaning `name.mar`.
pub fn parse_model_arg(arg: &str) -> Result<(String, String)> {
    let (name, archive) = match arg.split_once('=') {
        Some((name, archive)) => (name.trim().to_string(), archive.trim().to_string()),
        None => (arg.trim().to_string(), format!("{}.mar", arg.trim())),
    };
    validate_model_name(&name)?;
    validate_archive_name(&archive)?;
    Ok((name, archive))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        inference_address = "0.0.0.0:8085"
        management_address = "0.0.0.0:8086"
        model_store = "/home/model-server/model_store"
        default_response_timeout_secs = 60

        [models]
        "llama2-7b-chat" = "llama2-7b-chat.mar"

        [models.tiny]
        archive = "tiny.mar"
        workers = 2
        required = false
    "#;

    #[test]
    fn test_parse_example() {
        let config = ServingConfig::from_toml(EXAMPLE).unwrap();
        assert_eq!(config.inference_addr().unwrap().port(), 8085);
        assert_eq!(config.management_addr().unwrap().port(), 8086);
        assert_eq!(config.logging.level, "info");

        let specs = config.model_specs();
        assert_eq!(specs.len(), 2);

        let llama = specs.iter().find(|s| s.name == "llama2-7b-chat").unwrap();
        assert_eq!(llama.archive, "llama2-7b-chat.mar");
        assert_eq!(llama.workers, 4);
        assert_eq!(llama.timeout, Duration::from_secs(60));
        assert!(llama.required);

        let tiny = specs.iter().find(|s| s.name == "tiny").unwrap();
        assert_eq!(tiny.workers, 2);
        assert!(!tiny.required);
    }

    #[test]
    fn test_model_store_is_required() {
        let err = ServingConfig::from_toml("inference_address = \"0.0.0.0:1\"").unwrap_err();
        assert!(matches!(err, ServeError::Toml(_)));
    }

    #[test]
    fn test_rejects_same_address() {
        let err = ServingConfig::from_toml(
            r#"
            inference_address = "127.0.0.1:9000"
            management_address = "127.0.0.1:9000"
            model_store = "/tmp/store"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_ephemeral_ports_allowed() {
        let config = ServingConfig::from_toml(
            r#"
            inference_address = "127.0.0.1:0"
            management_address = "127.0.0.1:0"
            model_store = "/tmp/store"
            "#,
        )
        .unwrap();
        assert!(config.models.is_empty());
    }

    #[test]
    fn test_rejects_escaping_archive() {
        let err = ServingConfig::from_toml(
            r#"
            model_store = "/tmp/store"
            [models]
            evil = "../etc/passwd"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid archive"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = ServingConfig::from_toml(
            r#"
            model_store = "/tmp/store"
            [models.m]
            archive = "m.mar"
            workers = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        let err = ServingConfig::from_toml(
            r#"
            model_store = "/tmp/store"
            [logging]
            level = "info"
            format = "xml"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("log format"));
    }

    #[test]
    fn test_parse_model_arg() {
        assert_eq!(
            parse_model_arg("llama2-7b-chat=llama2-7b-chat.mar").unwrap(),
            ("llama2-7b-chat".to_string(), "llama2-7b-chat.mar".to_string())
        );
        assert_eq!(
            parse_model_arg("tiny").unwrap(),
            ("tiny".to_string(), "tiny.mar".to_string())
        );
        assert!(parse_model_arg("bad name=x.mar").is_err());
        assert!(parse_model_arg("m=/abs/path.mar").is_err());
    }

    #[test]
    fn test_save_and_reload_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("config.toml");

        ServingConfig::default().save(&path).unwrap();
        let loaded = ServingConfig::load(&path).unwrap();

        assert_eq!(loaded.inference_address, "0.0.0.0:8085");
        assert_eq!(
            loaded.models.get("llama2-7b-chat"),
            Some(&ModelEntry::Archive("llama2-7b-chat.mar".to_string()))
        );
    }
}
