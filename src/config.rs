use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_API_PREFIX: &str = "/api/v1";
const DEFAULT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_SUCCESS_DELAY_MS: u64 = 2_000;

const CONFIG_DIR: &str = ".mentori";

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Backend connection settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Response cache settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Sign-in settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub success_delay_ms: Option<u64>,
    /// Shown to the user when asking for a Google ID token
    #[serde(default)]
    pub google_client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Main configuration structure. Every field is optional so layers can be merged;
/// the accessors below supply the built-in defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from default paths
    /// Priority: local (.mentori/config.local.toml) > project (.mentori/config.toml) > user (~/.mentori/config.toml)
    pub fn load() -> Result<Self> {
        Self::load_layers(dirs::home_dir().as_deref(), Path::new("."))
    }

    /// Layered load rooted at explicit directories
    pub fn load_layers(home: Option<&Path>, project: &Path) -> Result<Self> {
        let mut config = Self::default();

        let mut layers = Vec::new();
        if let Some(home) = home {
            layers.push(home.join(CONFIG_DIR).join("config.toml"));
        }
        layers.push(project.join(CONFIG_DIR).join("config.toml"));
        // Local overrides, should be gitignored
        layers.push(project.join(CONFIG_DIR).join("config.local.toml"));

        for path in layers {
            if path.exists() {
                config.merge(Self::load_from(&path)?);
            }
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Merge another config into this one (other takes priority where set)
    pub fn merge(&mut self, other: Config) {
        if other.api.base_url.is_some() {
            self.api.base_url = other.api.base_url;
        }
        if other.api.prefix.is_some() {
            self.api.prefix = other.api.prefix;
        }
        if other.api.timeout_ms.is_some() {
            self.api.timeout_ms = other.api.timeout_ms;
        }

        if other.cache.ttl_secs.is_some() {
            self.cache.ttl_secs = other.cache.ttl_secs;
        }
        if other.cache.enabled.is_some() {
            self.cache.enabled = other.cache.enabled;
        }

        if other.auth.success_delay_ms.is_some() {
            self.auth.success_delay_ms = other.auth.success_delay_ms;
        }
        if other.auth.google_client_id.is_some() {
            self.auth.google_client_id = other.auth.google_client_id;
        }

        if other.storage.state_dir.is_some() {
            self.storage.state_dir = other.storage.state_dir;
        }
    }

    pub fn base_url(&self) -> &str {
        self.api.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn api_prefix(&self) -> &str {
        self.api.prefix.as_deref().unwrap_or(DEFAULT_API_PREFIX)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.api.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS))
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.enabled.unwrap_or(true)
    }

    pub fn success_delay(&self) -> Duration {
        Duration::from_millis(self.auth.success_delay_ms.unwrap_or(DEFAULT_SUCCESS_DELAY_MS))
    }

    /// Directory holding state.json, history and transcripts
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage.state_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|home| home.join(CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR))
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    /// Effective settings with defaults filled in, as TOML
    pub fn effective(&self) -> String {
        let resolved = Config {
            api: ApiConfig {
                base_url: Some(self.base_url().to_string()),
                prefix: Some(self.api_prefix().to_string()),
                timeout_ms: Some(self.timeout().as_millis() as u64),
            },
            cache: CacheConfig {
                ttl_secs: Some(self.cache_ttl().as_secs()),
                enabled: Some(self.cache_enabled()),
            },
            auth: AuthConfig {
                success_delay_ms: Some(self.success_delay().as_millis() as u64),
                google_client_id: self.auth.google_client_id.clone(),
            },
            storage: StorageConfig {
                state_dir: Some(self.state_dir()),
            },
        };
        toml::to_string_pretty(&resolved).unwrap_or_default()
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let base_url = self.base_url();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            errors.push(ValidationError {
                field: "api.base_url".to_string(),
                message: format!("Expected an http:// or https:// URL, got '{}'", base_url),
            });
        }

        if !self.api_prefix().starts_with('/') {
            errors.push(ValidationError {
                field: "api.prefix".to_string(),
                message: format!("Must start with '/', got '{}'", self.api_prefix()),
            });
        }

        if self.api.timeout_ms == Some(0) {
            errors.push(ValidationError {
                field: "api.timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        let cfg_dir = dir.join(CONFIG_DIR);
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(cfg_dir.join(name), content).unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.base_url(), "http://localhost:8080");
        assert_eq!(config.api_prefix(), "/api/v1");
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert!(config.cache_enabled());
        assert_eq!(config.success_delay(), Duration::from_millis(2000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_layers_override_in_order() {
        let home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        write(
            home.path(),
            "config.toml",
            "[api]\nbase_url = \"https://user.example\"\ntimeout_ms = 1000\n",
        );
        write(
            project.path(),
            "config.toml",
            "[api]\nbase_url = \"https://project.example\"\n[cache]\nenabled = false\n",
        );
        write(
            project.path(),
            "config.local.toml",
            "[cache]\nttl_secs = 60\n",
        );

        let config = Config::load_layers(Some(home.path()), project.path()).unwrap();
        assert_eq!(config.base_url(), "https://project.example");
        assert_eq!(config.timeout(), Duration::from_millis(1000));
        assert!(!config.cache_enabled());
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_layers_are_skipped() {
        let project = TempDir::new().unwrap();
        let config = Config::load_layers(None, project.path()).unwrap();
        assert_eq!(config.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let project = TempDir::new().unwrap();
        write(project.path(), "config.toml", "[api\nbase_url = 1");
        assert!(Config::load_layers(None, project.path()).is_err());
    }

    #[test]
    fn test_validate_bad_values() {
        let mut config = Config::default();
        config.api.base_url = Some("localhost:8080".to_string());
        config.api.prefix = Some("api/v1".to_string());
        config.api.timeout_ms = Some(0);

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].field, "api.base_url");
        assert!(errors[1].message.contains("start with '/'"));
        assert!(errors[2].to_string().contains("api.timeout_ms"));
    }

    #[test]
    fn test_state_dir_override() {
        let mut config = Config::default();
        config.storage.state_dir = Some(PathBuf::from("/tmp/mentori-state"));
        assert_eq!(
            config.state_file(),
            PathBuf::from("/tmp/mentori-state/state.json")
        );
    }

    #[test]
    fn test_effective_fills_defaults() {
        let config = Config::default();
        let text = config.effective();
        assert!(text.contains("base_url = \"http://localhost:8080\""));
        assert!(text.contains("ttl_secs = 300"));
    }
}
