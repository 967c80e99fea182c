use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::execution::ModelPricing;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub calendar: CalendarConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
    pub temperature: f32,
    pub pricing: ModelPricing,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    pub cron_secret: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct CalendarConfig {
    pub sync_window_days: u32,
    pub cache_ttl_hours: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }
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
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub server_port: Option<u16>,
    pub cron_secret: Option<String>,
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
                url: "sqlite://tandem.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: None,
                model: "llama3.1".to_string(),
                timeout_ms: 3_500,
                temperature: 0.7,
                pricing: ModelPricing::default(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                cron_secret: None,
            },
            calendar: CalendarConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self { sync_window_days: 30, cache_ttl_hours: 24 }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
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

impl LlmConfig {
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tandem.toml"));
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

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_ms) = llm.timeout_ms {
                self.llm.timeout_ms = timeout_ms;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(price) = llm.prompt_price_per_million {
                self.llm.pricing.prompt_per_million = price;
            }
            if let Some(price) = llm.completion_price_per_million {
                self.llm.pricing.completion_per_million = price;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(cron_secret) = server.cron_secret {
                self.server.cron_secret = Some(secret_value(cron_secret));
            }
        }

        if let Some(calendar) = patch.calendar {
            if let Some(sync_window_days) = calendar.sync_window_days {
                self.calendar.sync_window_days = sync_window_days;
            }
            if let Some(cache_ttl_hours) = calendar.cache_ttl_hours {
                self.calendar.cache_ttl_hours = cache_ttl_hours;
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
        if let Some(value) = read_env("TANDEM_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TANDEM_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("TANDEM_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TANDEM_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TANDEM_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TANDEM_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("TANDEM_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TANDEM_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("TANDEM_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("TANDEM_LLM_TIMEOUT_MS") {
            self.llm.timeout_ms = parse_u64("TANDEM_LLM_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("TANDEM_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f32("TANDEM_LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("TANDEM_LLM_PROMPT_PRICE_PER_MILLION") {
            self.llm.pricing.prompt_per_million =
                parse_decimal("TANDEM_LLM_PROMPT_PRICE_PER_MILLION", &value)?;
        }
        if let Some(value) = read_env("TANDEM_LLM_COMPLETION_PRICE_PER_MILLION") {
            self.llm.pricing.completion_per_million =
                parse_decimal("TANDEM_LLM_COMPLETION_PRICE_PER_MILLION", &value)?;
        }

        if let Some(value) = read_env("TANDEM_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TANDEM_SERVER_PORT") {
            self.server.port = parse_u16("TANDEM_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("TANDEM_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TANDEM_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        let cron_secret =
            read_env("TANDEM_SERVER_CRON_SECRET").or_else(|| read_env("TANDEM_CRON_SECRET"));
        if let Some(value) = cron_secret {
            self.server.cron_secret = Some(secret_value(value));
        }

        if let Some(value) = read_env("TANDEM_CALENDAR_SYNC_WINDOW_DAYS") {
            self.calendar.sync_window_days =
                parse_u32("TANDEM_CALENDAR_SYNC_WINDOW_DAYS", &value)?;
        }
        if let Some(value) = read_env("TANDEM_CALENDAR_CACHE_TTL_HOURS") {
            self.calendar.cache_ttl_hours = parse_u32("TANDEM_CALENDAR_CACHE_TTL_HOURS", &value)?;
        }

        let log_level = read_env("TANDEM_LOGGING_LEVEL").or_else(|| read_env("TANDEM_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TANDEM_LOGGING_FORMAT").or_else(|| read_env("TANDEM_LOG_FORMAT"));
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
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(cron_secret) = overrides.cron_secret {
            self.server.cron_secret = Some(secret_value(cron_secret));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_calendar(&self.calendar)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tandem.toml"), PathBuf::from("config/tandem.toml")]
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

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_ms < 100 || llm.timeout_ms > 120_000 {
        return Err(ConfigError::Validation(
            "llm.timeout_ms must be in range 100..=120000".to_string(),
        ));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if llm.pricing.prompt_per_million.is_sign_negative()
        || llm.pricing.completion_per_million.is_sign_negative()
    {
        return Err(ConfigError::Validation(
            "llm token prices must not be negative".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.provider == LlmProvider::OpenAi {
        let missing = llm
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(
                "llm.api_key is required for the openai provider (set TANDEM_LLM_API_KEY)"
                    .to_string(),
            ));
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    let blank_secret = server
        .cron_secret
        .as_ref()
        .map(|value| value.expose_secret().trim().is_empty())
        .unwrap_or(false);
    if blank_secret {
        return Err(ConfigError::Validation(
            "server.cron_secret must not be blank when set; remove it to disable the check"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_calendar(calendar: &CalendarConfig) -> Result<(), ConfigError> {
    if calendar.sync_window_days == 0 || calendar.sync_window_days > 365 {
        return Err(ConfigError::Validation(
            "calendar.sync_window_days must be in range 1..=365".to_string(),
        ));
    }

    if calendar.cache_ttl_hours == 0 || calendar.cache_ttl_hours > 168 {
        return Err(ConfigError::Validation(
            "calendar.cache_ttl_hours must be in range 1..=168".to_string(),
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

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| invalid_override(key, value))
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    value.parse::<Decimal>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    calendar: Option<CalendarPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_ms: Option<u64>,
    temperature: Option<f32>,
    prompt_price_per_million: Option<Decimal>,
    completion_price_per_million: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    cron_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CalendarPatch {
    sync_window_days: Option<u32>,
    cache_ttl_hours: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use rust_decimal::Decimal;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_without_any_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.llm.timeout_ms == 3_500, "llm timeout should default to 3500ms")?;
        ensure(config.calendar.sync_window_days == 30, "sync window should default to 30 days")?;
        ensure(config.calendar.cache_ttl_hours == 24, "cache ttl should default to 24 hours")?;
        ensure(config.server.cron_secret.is_none(), "cron secret should be unset by default")?;
        ensure(
            config.llm.effective_base_url() == "http://localhost:11434/v1",
            "ollama base url should be derived from the provider",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_TANDEM_LLM_KEY", "sk-from-env");
        env::set_var("TEST_TANDEM_CRON", "cron-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("tandem.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "openai"
api_key = "${TEST_TANDEM_LLM_KEY}"

[server]
cron_secret = "${TEST_TANDEM_CRON}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should come from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )?;
            ensure(
                config.server.cron_secret.as_ref().map(|s| s.expose_secret() == "cron-from-env")
                    == Some(true),
                "cron secret should be interpolated from environment",
            )
        })();

        clear_vars(&["TEST_TANDEM_LLM_KEY", "TEST_TANDEM_CRON"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("tandem.toml");
        fs::write(&path, "[llm]\nmodel = \"${TANDEM_TEST_UNSET_MODEL}\"\n")
            .map_err(|err| err.to_string())?;

        let error =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                .err()
                .ok_or_else(|| "expected interpolation failure".to_string())?;
        ensure(
            matches!(
                error,
                ConfigError::MissingEnvInterpolation { ref var } if var == "TANDEM_TEST_UNSET_MODEL"
            ),
            "error should name the missing variable",
        )
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TANDEM_LOG_LEVEL", "warn");
        env::set_var("TANDEM_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["TANDEM_LOG_LEVEL", "TANDEM_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TANDEM_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("TANDEM_LLM_TIMEOUT_MS", "5000");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("tandem.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[llm]
timeout_ms = 2000
model = "from-file"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.llm.timeout_ms == 5_000, "env timeout should win over file")?;
            ensure(config.llm.model == "from-file", "file model should win over defaults")
        })();

        clear_vars(&["TANDEM_DATABASE_URL", "TANDEM_LLM_TIMEOUT_MS"]);
        result
    }

    #[test]
    fn token_prices_come_from_file_and_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TANDEM_LLM_COMPLETION_PRICE_PER_MILLION", "12.5");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("tandem.toml");
            fs::write(
                &path,
                r#"
[llm]
prompt_price_per_million = "0.15"
completion_price_per_million = "0.60"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.llm.pricing.prompt_per_million == Decimal::new(15, 2),
                "prompt price should come from file",
            )?;
            ensure(
                config.llm.pricing.completion_per_million == Decimal::new(125, 1),
                "env completion price should win over file",
            )
        })();

        clear_vars(&["TANDEM_LLM_COMPLETION_PRICE_PER_MILLION"]);
        result
    }

    #[test]
    fn negative_token_price_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TANDEM_LLM_PROMPT_PRICE_PER_MILLION", "-1");
        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::Validation(message)) => {
                ensure(message.contains("price"), "validation should mention the price")
            }
            _ => Err("expected a validation failure".to_string()),
        };

        clear_vars(&["TANDEM_LLM_PROMPT_PRICE_PER_MILLION"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TANDEM_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["TANDEM_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_numeric_override_names_the_variable() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TANDEM_CALENDAR_SYNC_WINDOW_DAYS", "a month");
        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => ensure(
                key == "TANDEM_CALENDAR_SYNC_WINDOW_DAYS",
                "error should name the bad variable",
            ),
            _ => Err("expected an invalid override error".to_string()),
        };

        clear_vars(&["TANDEM_CALENDAR_SYNC_WINDOW_DAYS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TANDEM_LLM_API_KEY", "sk-secret-value");
        env::set_var("TANDEM_CRON_SECRET", "cron-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("cron-secret-value"),
                "debug output should not contain cron secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["TANDEM_LLM_API_KEY", "TANDEM_CRON_SECRET"]);
        result
    }
}
