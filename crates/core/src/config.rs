use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub platform: PlatformConfig,
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// External chat-bot platform credentials and endpoints.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub api_base_url: String,
    pub api_token: SecretString,
    /// Expected `hub.verify_token` for the webhook verification handshake.
    pub verify_token: SecretString,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Drain stops re-attempting a record once it reaches this many attempts.
    pub max_attempts: u32,
    /// Fixed inter-item delay while draining the outbound queue.
    pub drain_delay_ms: u64,
    /// Fixed inter-item delay during bulk backfill runs.
    pub bulk_delay_ms: u64,
    /// Finished bulk-sync progress entries are evicted after this window.
    pub progress_retention_secs: u64,
    /// Bound on per-item error lists in progress snapshots.
    pub max_recorded_errors: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub platform_api_base_url: Option<String>,
    pub platform_api_token: Option<String>,
    pub platform_verify_token: Option<String>,
    pub sync_max_attempts: Option<u32>,
    pub sync_drain_delay_ms: Option<u64>,
    pub sync_bulk_delay_ms: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://motocrm.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            platform: PlatformConfig {
                api_base_url: String::new(),
                api_token: String::new().into(),
                verify_token: String::new().into(),
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8090,
                health_check_port: 8091,
                graceful_shutdown_secs: 15,
            },
            sync: SyncConfig {
                max_attempts: 5,
                drain_delay_ms: 50,
                bulk_delay_ms: 50,
                progress_retention_secs: 3600,
                max_recorded_errors: 25,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("motocrm.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(platform) = patch.platform {
            if let Some(api_base_url) = platform.api_base_url {
                self.platform.api_base_url = api_base_url;
            }
            if let Some(api_token_value) = platform.api_token {
                self.platform.api_token = secret_value(api_token_value);
            }
            if let Some(verify_token_value) = platform.verify_token {
                self.platform.verify_token = secret_value(verify_token_value);
            }
            if let Some(timeout_secs) = platform.timeout_secs {
                self.platform.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(sync) = patch.sync {
            if let Some(max_attempts) = sync.max_attempts {
                self.sync.max_attempts = max_attempts;
            }
            if let Some(drain_delay_ms) = sync.drain_delay_ms {
                self.sync.drain_delay_ms = drain_delay_ms;
            }
            if let Some(bulk_delay_ms) = sync.bulk_delay_ms {
                self.sync.bulk_delay_ms = bulk_delay_ms;
            }
            if let Some(progress_retention_secs) = sync.progress_retention_secs {
                self.sync.progress_retention_secs = progress_retention_secs;
            }
            if let Some(max_recorded_errors) = sync.max_recorded_errors {
                self.sync.max_recorded_errors = max_recorded_errors;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("MOTOCRM_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("MOTOCRM_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("MOTOCRM_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("MOTOCRM_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("MOTOCRM_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("MOTOCRM_PLATFORM_API_BASE_URL") {
            self.platform.api_base_url = value;
        }
        if let Some(value) = read_env("MOTOCRM_PLATFORM_API_TOKEN") {
            self.platform.api_token = secret_value(value);
        }
        if let Some(value) = read_env("MOTOCRM_PLATFORM_VERIFY_TOKEN") {
            self.platform.verify_token = secret_value(value);
        }
        if let Some(value) = read_env("MOTOCRM_PLATFORM_TIMEOUT_SECS") {
            self.platform.timeout_secs = parse_u64("MOTOCRM_PLATFORM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("MOTOCRM_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("MOTOCRM_SERVER_PORT") {
            self.server.port = parse_u16("MOTOCRM_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("MOTOCRM_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("MOTOCRM_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("MOTOCRM_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("MOTOCRM_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("MOTOCRM_SYNC_MAX_ATTEMPTS") {
            self.sync.max_attempts = parse_u32("MOTOCRM_SYNC_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("MOTOCRM_SYNC_DRAIN_DELAY_MS") {
            self.sync.drain_delay_ms = parse_u64("MOTOCRM_SYNC_DRAIN_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("MOTOCRM_SYNC_BULK_DELAY_MS") {
            self.sync.bulk_delay_ms = parse_u64("MOTOCRM_SYNC_BULK_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("MOTOCRM_SYNC_PROGRESS_RETENTION_SECS") {
            self.sync.progress_retention_secs =
                parse_u64("MOTOCRM_SYNC_PROGRESS_RETENTION_SECS", &value)?;
        }

        let log_level =
            read_env("MOTOCRM_LOGGING_LEVEL").or_else(|| read_env("MOTOCRM_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("MOTOCRM_LOGGING_FORMAT").or_else(|| read_env("MOTOCRM_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(api_base_url) = overrides.platform_api_base_url {
            self.platform.api_base_url = api_base_url;
        }
        if let Some(api_token) = overrides.platform_api_token {
            self.platform.api_token = secret_value(api_token);
        }
        if let Some(verify_token) = overrides.platform_verify_token {
            self.platform.verify_token = secret_value(verify_token);
        }
        if let Some(max_attempts) = overrides.sync_max_attempts {
            self.sync.max_attempts = max_attempts;
        }
        if let Some(drain_delay_ms) = overrides.sync_drain_delay_ms {
            self.sync.drain_delay_ms = drain_delay_ms;
        }
        if let Some(bulk_delay_ms) = overrides.sync_bulk_delay_ms {
            self.sync.bulk_delay_ms = bulk_delay_ms;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_platform(&self.platform)?;
        validate_server(&self.server)?;
        validate_sync(&self.sync)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("motocrm.toml"), PathBuf::from("config/motocrm.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_platform(platform: &PlatformConfig) -> Result<(), ConfigError> {
    let base_url = platform.api_base_url.trim();
    if base_url.is_empty() {
        return Err(ConfigError::Validation(
            "platform.api_base_url is required (the chat platform's REST endpoint)".to_string(),
        ));
    }
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "platform.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if platform.api_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "platform.api_token is required for outbound synchronization".to_string(),
        ));
    }

    if platform.verify_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "platform.verify_token is required for the webhook verification handshake"
                .to_string(),
        ));
    }

    if platform.timeout_secs == 0 || platform.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "platform.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation(
            "server.port must be greater than zero".to_string(),
        ));
    }

    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.port == server.health_check_port {
        return Err(ConfigError::Validation(
            "server.port and server.health_check_port must differ".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_sync(sync: &SyncConfig) -> Result<(), ConfigError> {
    if sync.max_attempts == 0 {
        return Err(ConfigError::Validation(
            "sync.max_attempts must be greater than zero".to_string(),
        ));
    }

    if sync.progress_retention_secs == 0 {
        return Err(ConfigError::Validation(
            "sync.progress_retention_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    platform: Option<PlatformPatch>,
    server: Option<ServerPatch>,
    sync: Option<SyncPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PlatformPatch {
    api_base_url: Option<String>,
    api_token: Option<String>,
    verify_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncPatch {
    max_attempts: Option<u32>,
    drain_delay_ms: Option<u64>,
    bulk_delay_ms: Option<u64>,
    progress_retention_secs: Option<u64>,
    max_recorded_errors: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
