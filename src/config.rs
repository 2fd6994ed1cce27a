use serde::{Deserialize, Deserializer};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Custom deserializer for comma-separated strings
fn deserialize_comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Comma-separated port numbers; entries that are not valid ports are rejected.
fn deserialize_port_list<'de, D>(deserializer: D) -> Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_comma_separated(deserializer)?
        .iter()
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| serde::de::Error::custom(format!("invalid port '{}'", p)))
        })
        .collect()
}

/// Application settings with environment variable support
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Database (in-memory repositories when unset)
    pub database_url: Option<String>,

    // Server
    pub bind_address: String,
    #[serde(deserialize_with = "deserialize_comma_separated")]
    pub cors_allow_origins: Vec<String>,

    // Logging
    pub log_level: String,
    pub log_format: String,

    // Admission and progress fan-out
    pub max_concurrent_scans: u32,
    pub progress_channel_capacity: u32,

    // Streaming engine
    pub nmap_path: String,
    pub nmap_default_args: String,
    pub nmap_stats_interval_seconds: u32,
    pub nmap_os_detection: bool,

    // Remote task engine
    pub gvm_socket_path: Option<String>,
    pub gvm_host: String,
    pub gvm_port: u16,
    pub gvm_username: String,
    pub gvm_password: String,
    pub gvm_poll_interval_seconds: f64,
    pub gvm_timeout_seconds: f64,
    pub gvm_scanner_id: String,
    pub gvm_port_list_id: String,
    pub gvm_default_config_id: String,
    /// gvmd ships self-signed certificates, so TCP connections skip
    /// certificate checks unless this is set.
    pub gvm_tls_verify: bool,

    // Plugins
    pub banner_timeout_seconds: f64,
    #[serde(deserialize_with = "deserialize_port_list")]
    pub banner_default_ports: Vec<u16>,
}

impl Settings {
    /// Create new settings instance from environment variables and .env file
    pub fn new() -> Result<Self, ConfigError> {
        Self::new_with_env_file(true)
    }

    /// Create new settings instance with optional .env file loading
    pub fn new_with_env_file(load_env_file: bool) -> Result<Self, ConfigError> {
        // Tests mutate process env; serialize construction so reads are consistent
        static SETTINGS_BUILD_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        let build_mutex = SETTINGS_BUILD_MUTEX.get_or_init(|| Mutex::new(()));
        let _guard = build_mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        #[cfg(not(test))]
        {
            if load_env_file {
                dotenvy::dotenv().ok();
            }
        }

        let mut builder = config::Config::builder()
            .set_default("database_url", None::<String>)?
            .set_default("bind_address", "0.0.0.0:8000")?
            .set_default("cors_allow_origins", "http://localhost:3000,http://127.0.0.1:3000")?
            .set_default("log_level", "INFO")?
            .set_default("log_format", "json")?
            .set_default("max_concurrent_scans", 3u32)?
            .set_default("progress_channel_capacity", 256u32)?
            .set_default("nmap_path", "nmap")?
            .set_default("nmap_default_args", "-sV -T4 -F")?
            .set_default("nmap_stats_interval_seconds", 5u32)?
            .set_default("nmap_os_detection", false)?
            .set_default("gvm_socket_path", None::<String>)?
            .set_default("gvm_host", "127.0.0.1")?
            .set_default("gvm_port", 9390u32)?
            .set_default("gvm_username", "admin")?
            .set_default("gvm_password", "admin")?
            .set_default("gvm_poll_interval_seconds", 10.0)?
            .set_default("gvm_timeout_seconds", 30.0)?
            .set_default("gvm_scanner_id", "08b69003-5fc2-4037-a479-93b440211c73")?
            .set_default("gvm_port_list_id", "33d0cd82-57c6-11e1-8ed1-406186ea4fc5")?
            .set_default("gvm_default_config_id", "daba56c8-73ec-11df-a475-002264764cea")?
            .set_default("gvm_tls_verify", false)?
            .set_default("banner_timeout_seconds", 5.0)?
            .set_default(
                "banner_default_ports",
                "21,22,23,25,80,110,143,443,3306,5432,6379,8080,8443",
            )?;

        #[cfg(not(test))]
        {
            if load_env_file {
                builder = builder.add_source(config::File::with_name(".env").required(false));
            }
        }

        fn read_env(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.trim().is_empty())
        }

        fn parse_bool_env(key: &str) -> Option<bool> {
            read_env(key).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            })
        }

        // String overrides
        for (env_key, setting) in [
            ("DATABASE_URL", "database_url"),
            ("BIND_ADDRESS", "bind_address"),
            ("CORS_ALLOW_ORIGINS", "cors_allow_origins"),
            ("LOG_LEVEL", "log_level"),
            ("LOG_FORMAT", "log_format"),
            ("NMAP_PATH", "nmap_path"),
            ("NMAP_DEFAULT_ARGS", "nmap_default_args"),
            ("GVM_SOCKET_PATH", "gvm_socket_path"),
            ("GVM_HOST", "gvm_host"),
            ("GVM_USERNAME", "gvm_username"),
            ("GVM_PASSWORD", "gvm_password"),
            ("GVM_SCANNER_ID", "gvm_scanner_id"),
            ("GVM_PORT_LIST_ID", "gvm_port_list_id"),
            ("GVM_DEFAULT_CONFIG_ID", "gvm_default_config_id"),
            ("BANNER_DEFAULT_PORTS", "banner_default_ports"),
        ] {
            if let Some(v) = read_env(env_key) {
                builder = builder.set_override(setting, v)?;
            }
        }

        // Numeric overrides
        if let Some(v) = read_env("MAX_CONCURRENT_SCANS").and_then(|s| s.parse::<u32>().ok()) { builder = builder.set_override("max_concurrent_scans", v)?; }
        if let Some(v) = read_env("PROGRESS_CHANNEL_CAPACITY").and_then(|s| s.parse::<u32>().ok()) { builder = builder.set_override("progress_channel_capacity", v)?; }
        if let Some(v) = read_env("NMAP_STATS_INTERVAL_SECONDS").and_then(|s| s.parse::<u32>().ok()) { builder = builder.set_override("nmap_stats_interval_seconds", v)?; }
        if let Some(v) = read_env("GVM_PORT").and_then(|s| s.parse::<u32>().ok()) { builder = builder.set_override("gvm_port", v)?; }
        if let Some(v) = read_env("GVM_POLL_INTERVAL_SECONDS").and_then(|s| s.parse::<f64>().ok()) { builder = builder.set_override("gvm_poll_interval_seconds", v)?; }
        if let Some(v) = read_env("GVM_TIMEOUT_SECONDS").and_then(|s| s.parse::<f64>().ok()) { builder = builder.set_override("gvm_timeout_seconds", v)?; }
        if let Some(v) = read_env("BANNER_TIMEOUT_SECONDS").and_then(|s| s.parse::<f64>().ok()) { builder = builder.set_override("banner_timeout_seconds", v)?; }

        // Boolean overrides
        if let Some(v) = parse_bool_env("NMAP_OS_DETECTION") { builder = builder.set_override("nmap_os_detection", v)?; }
        if let Some(v) = parse_bool_env("GVM_TLS_VERIFY") { builder = builder.set_override("gvm_tls_verify", v)?; }

        let settings = builder.build()?;

        let config: Settings = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "plain") {
            return Err(ConfigError::Validation(
                "log_format must be 'json' or 'plain'".to_string(),
            ));
        }

        if self.max_concurrent_scans == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_scans must be greater than 0".to_string(),
            ));
        }

        if self.progress_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "progress_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.nmap_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "nmap_path must not be empty".to_string(),
            ));
        }

        if self.gvm_poll_interval_seconds <= 0.0 {
            return Err(ConfigError::Validation(
                "gvm_poll_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.gvm_timeout_seconds <= 0.0 {
            return Err(ConfigError::Validation(
                "gvm_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.banner_timeout_seconds <= 0.0 {
            return Err(ConfigError::Validation(
                "banner_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "bind_address '{}' is not a socket address",
                self.bind_address
            )));
        }

        Ok(())
    }

    pub fn gvm_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.gvm_poll_interval_seconds)
    }

    pub fn gvm_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.gvm_timeout_seconds)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.banner_timeout_seconds)
    }
}
