//! Saltern configuration file handling.
//!
//! TOML operator configuration: deployment settings (server identity, storage
//! path, peer lists, schedule intervals, logging). The hash catalog itself and
//! the pepper slots live in the database, never in this file.

use saltern::directory::LocalUser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Saltern service configuration (operator settings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalternConfig {
    /// Local server identity
    pub identity: IdentityConfig,

    /// Database settings
    pub storage: StorageConfig,

    /// Local user directory entries
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Optional homeserver view; absent means every local user counts as
    /// active
    #[serde(default)]
    pub homeserver_view: Option<HomeserverViewConfig>,

    /// Remote peer lists
    #[serde(default)]
    pub federation: FederationConfig,

    /// Job intervals
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local server identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Server name used in matrix addresses (`@uid:<server_name>`)
    pub server_name: String,

    /// Base URL of this service; its host (and explicit port) identifies us
    /// in pushes to peers
    pub base_url: String,
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database
    pub database: PathBuf,
}

/// Static local user directory. Real deployments replace this with an
/// LDAP/SQL adapter behind the same trait.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub users: Vec<LocalUser>,
}

/// Homeserver view contents (`@uid:domain` names).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeserverViewConfig {
    pub users: Vec<String>,
}

/// The two independent peer lists. Both run the same sync logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FederationConfig {
    /// Federation servers (`hostname` or `hostname:port`)
    #[serde(default)]
    pub servers: Vec<String>,

    /// Federated identity services
    #[serde(default)]
    pub identity_services: Vec<String>,
}

impl FederationConfig {
    /// Whether any peer is configured at all. Gates identifier suppression
    /// in the incremental sync.
    pub fn peers_configured(&self) -> bool {
        !self.servers.is_empty() || !self.identity_services.is_empty()
    }
}

/// Job intervals as humantime strings ("24h", "10m", "90s").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_rotation_interval")]
    pub rotation: String,

    #[serde(default = "default_incremental_interval")]
    pub incremental: String,

    #[serde(default = "default_federation_interval")]
    pub federation: String,
}

impl ScheduleConfig {
    /// Parse the configured interval strings.
    pub fn intervals(
        &self,
    ) -> Result<saltern::scheduler::ScheduleIntervals, Box<dyn std::error::Error>> {
        Ok(saltern::scheduler::ScheduleIntervals {
            rotation: parse_interval("schedule.rotation", &self.rotation)?,
            incremental: parse_interval("schedule.incremental", &self.incremental)?,
            federation: parse_interval("schedule.federation", &self.federation)?,
        })
    }
}

fn parse_interval(name: &str, value: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    humantime::parse_duration(value)
        .map_err(|e| format!("invalid {name} interval '{value}': {e}").into())
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_rotation_interval() -> String {
    "24h".to_string()
}

fn default_incremental_interval() -> String {
    "10m".to_string()
}

fn default_federation_interval() -> String {
    "1h".to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            rotation: default_rotation_interval(),
            incremental: default_incremental_interval(),
            federation: default_federation_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl SalternConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: SalternConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file '{}': {}", path.display(), e))?;

        Ok(())
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(database: &Path) -> String {
        format!(
            r#"# Saltern Configuration (Operator Settings)
#
# The pepper slots and the hash catalog live in the database and are managed
# by the rotation and sync jobs; nothing in this file ever contains a pepper
# or a hash.

[identity]
# Server name used in matrix addresses (@uid:<server_name>)
server_name = "example.com"

# Base URL of this service. Its host (plus explicit port, if any) is the
# identifier peers see in lookup pushes.
base_url = "https://matrix.example.com"

[storage]
# Path to the SQLite database
database = "{database}"

[directory]
# Static local user directory. Real deployments replace this with an
# LDAP/SQL adapter.
# users = [ {{ uid = "dwho", email = "dwho@company.com", phone = "33612345678" }} ]
users = []

# Uncomment to gate liveness on the homeserver's own user list. Without this
# section every local user counts as active.
# [homeserver_view]
# users = ["@dwho:example.com"]

[federation]
# Federation servers to push hashes to ("hostname" or "hostname:port")
servers = []

# Federated identity services (same protocol, separate list)
identity_services = []

[schedule]
# Full pepper rotation + catalog rebuild
rotation = "24h"

# Incremental user reconciliation
incremental = "10m"

# Federation pushes
federation = "1h"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"
"#,
            database = database.display()
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(
        config_path: &Path,
        database: &Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let contents = Self::generate_default_toml(database);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(config_path, contents).map_err(|e| {
            format!(
                "Failed to write config file '{}': {}",
                config_path.display(),
                e
            )
        })?;

        Ok(())
    }

    /// Parse the base URL and derive the host identifier sent to peers.
    pub fn lookup_host(&self) -> Result<String, Box<dyn std::error::Error>> {
        let base = url::Url::parse(&self.identity.base_url)
            .map_err(|e| format!("invalid base_url '{}': {}", self.identity.base_url, e))?;
        saltern::jobs::federation::lookup_host(&base)
            .ok_or_else(|| format!("base_url '{}' has no host", self.identity.base_url).into())
    }
}

/// Default config file path (`~/.local/share/saltern/config.toml` or
/// platform equivalent).
pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Default database path adjacent to the config.
pub fn default_database_path() -> PathBuf {
    data_dir().join("saltern.db")
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("saltern")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn minimal() -> SalternConfig {
        SalternConfig {
            identity: IdentityConfig {
                server_name: "example.com".into(),
                base_url: "https://matrix.example.com".into(),
            },
            storage: StorageConfig {
                database: PathBuf::from("/tmp/saltern.db"),
            },
            directory: DirectoryConfig::default(),
            homeserver_view: None,
            federation: FederationConfig::default(),
            schedule: ScheduleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_create_and_load_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let database = temp_dir.path().join("saltern.db");

        SalternConfig::create_default(&config_path, &database).unwrap();
        assert!(config_path.exists());

        let config = SalternConfig::load(&config_path).unwrap();
        assert_eq!(config.identity.server_name, "example.com");
        assert_eq!(config.storage.database, database);
        assert_eq!(config.logging.level, "info");
        assert!(config.homeserver_view.is_none());
        assert!(!config.federation.peers_configured());
    }

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[identity]
server_name = "example.com"
base_url = "https://matrix.example.com:8448"

[storage]
database = "/tmp/saltern.db"
"#,
        )
        .unwrap();

        let config = SalternConfig::load(&config_path).unwrap();
        assert_eq!(config.schedule.rotation, "24h");
        assert_eq!(config.schedule.incremental, "10m");
        assert_eq!(config.logging.level, "info");
        assert!(config.directory.users.is_empty());
    }

    #[test]
    fn test_schedule_intervals_parse() {
        let schedule = ScheduleConfig {
            rotation: "24h".into(),
            incremental: "90s".into(),
            federation: "1h 30m".into(),
        };
        let intervals = schedule.intervals().unwrap();
        assert_eq!(intervals.rotation, Duration::from_secs(24 * 3600));
        assert_eq!(intervals.incremental, Duration::from_secs(90));
        assert_eq!(intervals.federation, Duration::from_secs(5400));

        let bad = ScheduleConfig {
            rotation: "soon".into(),
            ..ScheduleConfig::default()
        };
        assert!(bad.intervals().is_err());
    }

    #[test]
    fn test_lookup_host_includes_explicit_port() {
        let mut config = minimal();
        config.identity.base_url = "https://matrix.example.com:8448".into();
        assert_eq!(config.lookup_host().unwrap(), "matrix.example.com:8448");

        config.identity.base_url = "https://matrix.example.com".into();
        assert_eq!(config.lookup_host().unwrap(), "matrix.example.com");

        config.identity.base_url = "not a url".into();
        assert!(config.lookup_host().is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = minimal();
        config.federation.servers = vec!["peer.example.net:8448".into()];
        config.save(&path).unwrap();

        let loaded = SalternConfig::load(&path).unwrap();
        assert_eq!(loaded.federation.servers, config.federation.servers);
        assert!(loaded.federation.peers_configured());
    }
}
