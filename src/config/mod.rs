//! Configuration module for kopia-admin
//!
//! Supports configuration via:
//! - YAML/TOML config files
//! - Environment variables (with KOPIA_ADMIN__ prefix)
//!
//! The resulting [`AppConfig`] is built once at startup and handed to the
//! constructors that need it. Nothing below the binary reads the process
//! environment on its own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for the JSON log file (disabled when unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Container runtime connection
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Target container and settle policy
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Interactive credential dialogue
    #[serde(default)]
    pub dialogue: DialogueConfig,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// How to reach the container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker/Podman API socket (local defaults when unset)
    #[serde(default)]
    pub docker_socket: Option<String>,

    /// CLI binary used for the nested interactive exec
    #[serde(default = "default_docker_path")]
    pub docker_path: String,
}

/// Target container and settle policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Name of the running Kopia server container
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Kopia binary inside the container
    #[serde(default = "default_kopia_path")]
    pub kopia_path: String,

    /// Wait after issuing a create before reporting success
    #[serde(default = "default_create_settle_ms")]
    pub create_settle_ms: u64,

    /// Wait after a remove before reporting success
    #[serde(default = "default_remove_settle_ms")]
    pub remove_settle_ms: u64,
}

/// Prompts and limits for the scripted password dialogue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// First prompt printed by `kopia server user add`
    #[serde(default = "default_new_password_prompt")]
    pub new_password_prompt: String,

    /// Verification prompt
    #[serde(default = "default_verify_prompt")]
    pub verify_prompt: String,

    /// `expect` timeout for each prompt, in seconds
    #[serde(default = "default_dialogue_timeout")]
    pub timeout_secs: u64,

    /// Environment variable carrying the password into the container
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,

    /// Address the exporter listens on
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_docker_path() -> String {
    which::which("docker")
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| "docker".to_string())
}

fn default_container_name() -> String {
    "kopia-server".to_string()
}

fn default_kopia_path() -> String {
    "kopia".to_string()
}

fn default_create_settle_ms() -> u64 {
    15_000
}

fn default_remove_settle_ms() -> u64 {
    5_000
}

fn default_new_password_prompt() -> String {
    "Enter new password:".to_string()
}

fn default_verify_prompt() -> String {
    "Re-enter password for verification:".to_string()
}

fn default_dialogue_timeout() -> u64 {
    10
}

fn default_secret_env() -> String {
    "KOPIA_ADMIN_DIALOGUE_SECRET".to_string()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9451".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: None,
            docker_path: default_docker_path(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            container_name: default_container_name(),
            kopia_path: default_kopia_path(),
            create_settle_ms: default_create_settle_ms(),
            remove_settle_ms: default_remove_settle_ms(),
        }
    }
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            new_password_prompt: default_new_password_prompt(),
            verify_prompt: default_verify_prompt(),
            timeout_secs: default_dialogue_timeout(),
            secret_env: default_secret_env(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
            runtime: RuntimeConfig::default(),
            provisioning: ProvisioningConfig::default(),
            dialogue: DialogueConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ProvisioningConfig {
    pub fn create_settle_delay(&self) -> Duration {
        Duration::from_millis(self.create_settle_ms)
    }

    pub fn remove_settle_delay(&self) -> Duration {
        Duration::from_millis(self.remove_settle_ms)
    }
}

impl AppConfig {
    /// Load configuration from the default file locations and environment variables
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Load configuration, reading `path` instead of the default file locations
    pub fn load_with(path: Option<&Path>) -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder
                .add_source(config::File::with_name("config/kopia-admin").required(false))
                .add_source(config::File::with_name("/etc/kopia-admin/config").required(false)),
        };

        // Override with environment variables (KOPIA_ADMIN__ prefix)
        let config = builder
            .add_source(
                config::Environment::with_prefix("KOPIA_ADMIN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.provisioning.container_name.trim().is_empty() {
            anyhow::bail!("Container name cannot be empty");
        }

        if self.provisioning.kopia_path.trim().is_empty() {
            anyhow::bail!("Kopia path cannot be empty");
        }

        if self.dialogue.new_password_prompt.is_empty() || self.dialogue.verify_prompt.is_empty() {
            anyhow::bail!("Dialogue prompts cannot be empty");
        }

        if self.dialogue.timeout_secs == 0 {
            anyhow::bail!("Dialogue timeout cannot be 0");
        }

        if !is_env_name(&self.dialogue.secret_env) {
            anyhow::bail!(
                "Invalid secret environment variable name: {}",
                self.dialogue.secret_env
            );
        }

        Ok(())
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.provisioning.container_name, "kopia-server");
        assert_eq!(config.provisioning.create_settle_delay(), Duration::from_secs(15));
        assert_eq!(config.provisioning.remove_settle_delay(), Duration::from_secs(5));
        assert_eq!(config.dialogue.timeout_secs, 10);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        config.provisioning.container_name = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dialogue.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dialogue.verify_prompt.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_env_name() {
        assert!(is_env_name("KOPIA_SECRET"));
        assert!(is_env_name("_X1"));
        assert!(!is_env_name(""));
        assert!(!is_env_name("1ABC"));
        assert!(!is_env_name("A-B"));
        assert!(!is_env_name("A B"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[provisioning]
container_name = "kopia-test"
create_settle_ms = 250

[dialogue]
timeout_secs = 3
"#
        )
        .unwrap();

        let config = AppConfig::load_with(Some(file.path())).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.provisioning.container_name, "kopia-test");
        assert_eq!(config.provisioning.create_settle_ms, 250);
        assert_eq!(config.provisioning.remove_settle_ms, 5_000);
        assert_eq!(config.dialogue.timeout_secs, 3);
        assert_eq!(config.dialogue.new_password_prompt, "Enter new password:");
    }
}
