//! Settings and typed cluster configuration
//!
//! Three layers feed a cluster request, lowest precedence first:
//! built-in defaults ([`ClusterConfig::default`]), the global [`Settings`]
//! (settings file / command line), and per-call [`ClusterOverrides`].

pub mod scope;

pub use scope::{resolve, Scope, ScopeKey, TestUnit};

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streaming::StreamLoggingConfig;

/// Default timeout for cluster creation, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default timeout for a single cluster deletion, in seconds
pub const DEFAULT_TEARDOWN_TIMEOUT_SECS: u64 = 120;

/// Default settings file location: ~/.kindtest/config.yaml
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kindtest")
        .join("config.yaml")
}

/// Errors for settings and override handling
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    #[error("Invalid log level: {0}. Must be one of: DEBUG, INFO, WARNING, ERROR")]
    InvalidLogLevel(String),

    #[error("Invalid cluster name '{0}': must be lowercase alphanumerics and '-'")]
    InvalidName(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Host/container port mapping on the control-plane node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Fully merged configuration for one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Explicit cluster name; generated at creation time when absent
    pub name: Option<String>,
    pub scope: Scope,
    /// Kubernetes node image (e.g. "kindest/node:v1.30.0")
    pub image: Option<String>,
    pub timeout_secs: u64,
    /// Leave the cluster running after the last holder releases it
    pub keep: bool,
    /// Raw kind configuration file, used as-is
    pub config_path: Option<PathBuf>,
    /// Number of worker nodes next to the control plane
    pub workers: u32,
    pub extra_port_mappings: Vec<PortMapping>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: None,
            scope: Scope::Session,
            image: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            keep: false,
            config_path: None,
            workers: 0,
            extra_port_mappings: Vec::new(),
        }
    }
}

impl ClusterConfig {
    /// Layer overrides on top of this configuration
    pub fn apply(&mut self, overrides: &ClusterOverrides) {
        if let Some(name) = &overrides.name {
            self.name = Some(name.clone());
        }
        if let Some(scope) = overrides.scope {
            self.scope = scope;
        }
        if let Some(image) = &overrides.image {
            self.image = Some(image.clone());
        }
        if let Some(timeout) = overrides.timeout_secs {
            self.timeout_secs = timeout;
        }
        if let Some(keep) = overrides.keep {
            self.keep = keep;
        }
        if let Some(path) = &overrides.config_path {
            self.config_path = Some(expand_path(path));
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        if let Some(mappings) = &overrides.extra_port_mappings {
            self.extra_port_mappings = mappings.clone();
        }
    }

    /// Validate the merged configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeout must be at least one second".to_string(),
            ));
        }

        if let Some(name) = &self.name {
            validate_cluster_name(name)?;
        }

        if self.config_path.is_some()
            && (self.workers > 0 || !self.extra_port_mappings.is_empty())
        {
            return Err(ConfigError::Invalid(
                "'config_path' cannot be combined with 'workers' or 'extra_port_mappings'"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Whether a node configuration document has to be generated
    pub fn needs_generated_config(&self) -> bool {
        self.config_path.is_none()
            && (self.image.is_some() || self.workers > 0 || !self.extra_port_mappings.is_empty())
    }
}

/// Typed overrides for a cluster request
///
/// Used both for the global layer and for the per-call layer. Unknown fields
/// are rejected when deserialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_port_mappings: Option<Vec<PortMapping>>,
}

impl ClusterOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_keep(mut self, keep: bool) -> Self {
        self.keep = Some(keep);
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_port_mapping(mut self, mapping: PortMapping) -> Self {
        self.extra_port_mappings
            .get_or_insert_with(Vec::new)
            .push(mapping);
        self
    }
}

/// Global configuration consumed from the test framework layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub default_scope: Scope,
    pub default_timeout_secs: u64,
    pub keep_clusters: bool,
    pub logging: StreamLoggingConfig,
    pub cleanup_on_interrupt: bool,
    pub cleanup_orphaned: bool,
    /// Overrides the shared state file location (tests, isolated runs)
    pub state_file: Option<PathBuf>,
    pub kind_binary: PathBuf,
    pub kubectl_binary: PathBuf,
    pub teardown_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_scope: Scope::Session,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            keep_clusters: false,
            logging: StreamLoggingConfig::default(),
            cleanup_on_interrupt: true,
            cleanup_orphaned: true,
            state_file: None,
            kind_binary: PathBuf::from("kind"),
            kubectl_binary: PathBuf::from("kubectl"),
            teardown_timeout_secs: DEFAULT_TEARDOWN_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    /// The global override layer these settings contribute
    pub fn cluster_overrides(&self) -> ClusterOverrides {
        ClusterOverrides {
            scope: Some(self.default_scope),
            timeout_secs: Some(self.default_timeout_secs),
            keep: Some(self.keep_clusters),
            ..Default::default()
        }
    }

    /// Effective state file location
    pub fn state_file_path(&self) -> PathBuf {
        self.state_file
            .as_ref()
            .map(|p| expand_path(p))
            .unwrap_or_else(crate::state::default_state_path)
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse settings from a YAML string
pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Check a cluster name against what kind accepts
pub fn validate_cluster_name(name: &str) -> Result<(), ConfigError> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").ok());

    let valid = match pattern {
        Some(re) => re.is_match(name),
        None => !name.is_empty(),
    };

    if valid && name.len() <= 50 {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

/// Expand a leading `~` in a user supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).into_owned()),
        None => path.to_path_buf(),
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load settings from a file; a missing file yields defaults
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::LogLevel;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.default_scope, Scope::Session);
        assert_eq!(settings.default_timeout_secs, 300);
        assert!(!settings.keep_clusters);
        assert!(settings.cleanup_on_interrupt);
        assert!(settings.cleanup_orphaned);
        assert!(settings.logging.enabled);
    }

    #[test]
    fn test_parse_settings() {
        let yaml = r#"
default_scope: module
default_timeout_secs: 600
keep_clusters: true
logging:
  enabled: false
  stdout_level: debug
  stderr_level: ERROR
cleanup_orphaned: false
"#;
        let settings = parse_settings(yaml).unwrap();
        assert_eq!(settings.default_scope, Scope::Module);
        assert_eq!(settings.default_timeout_secs, 600);
        assert!(settings.keep_clusters);
        assert!(!settings.logging.enabled);
        assert_eq!(settings.logging.stdout_level, LogLevel::Debug);
        assert_eq!(settings.logging.stderr_level, LogLevel::Error);
        assert!(!settings.cleanup_orphaned);
        assert!(settings.cleanup_on_interrupt);
    }

    #[test]
    fn test_parse_settings_rejects_unknown_field() {
        let result = parse_settings("default_scop: module\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_overrides_reject_unknown_field() {
        let result: Result<ClusterOverrides, _> =
            serde_json::from_str(r#"{"image": "kindest/node:v1.30.0", "nodes": 3}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = ClusterConfig::default();
        config.apply(
            &ClusterOverrides::new()
                .with_scope(Scope::Function)
                .with_image("kindest/node:v1.29.0")
                .with_timeout(60),
        );

        assert_eq!(config.scope, Scope::Function);
        assert_eq!(config.image.as_deref(), Some("kindest/node:v1.29.0"));
        assert_eq!(config.timeout_secs, 60);
        assert!(!config.keep);
        assert!(config.name.is_none());
    }

    #[test]
    fn test_validate_config_path_conflict() {
        let config = ClusterConfig {
            config_path: Some(PathBuf::from("/tmp/kind.yaml")),
            workers: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = ClusterConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_cluster_name() {
        assert!(validate_cluster_name("kindtest-1a2b3c4d").is_ok());
        assert!(validate_cluster_name("Bad_Name").is_err());
        assert!(validate_cluster_name("-leading").is_err());
        assert!(validate_cluster_name("").is_err());
    }

    #[test]
    fn test_needs_generated_config() {
        assert!(!ClusterConfig::default().needs_generated_config());

        let with_image = ClusterConfig {
            image: Some("kindest/node:v1.30.0".to_string()),
            ..Default::default()
        };
        assert!(with_image.needs_generated_config());

        let with_raw = ClusterConfig {
            image: Some("kindest/node:v1.30.0".to_string()),
            config_path: Some(PathBuf::from("kind.yaml")),
            ..Default::default()
        };
        assert!(!with_raw.needs_generated_config());
    }

    #[test]
    fn test_settings_overrides_layer() {
        let settings = Settings {
            default_scope: Scope::Class,
            default_timeout_secs: 42,
            ..Default::default()
        };
        let overrides = settings.cluster_overrides();
        assert_eq!(overrides.scope, Some(Scope::Class));
        assert_eq!(overrides.timeout_secs, Some(42));
        assert_eq!(overrides.keep, Some(false));
        assert!(overrides.image.is_none());
    }

    #[test]
    fn test_load_settings_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"default_scope: function\n").unwrap();

        let settings = load_settings_from(file.path()).unwrap();
        assert_eq!(settings.default_scope, Scope::Function);
    }

    #[test]
    fn test_load_missing_settings_file() {
        let settings = load_settings_from(Path::new("/nonexistent/kindtest.yaml")).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
