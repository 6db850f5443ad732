use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::provider::SearchChannel;
use crate::domain::session::{DEFAULT_MAX_ROUNDS, MAX_ROUNDS, MIN_ROUNDS};
use crate::gateway::DEFAULT_CALL_TIMEOUT;
use crate::quota::QuotaPolicy;

pub const MIN_QUOTA_RETRIES: u32 = 5;
pub const MAX_QUOTA_RETRIES: u32 = 10;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub roles: RolesConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub max_rounds: u32,
    pub search_max_results: usize,
    pub facts_limit: usize,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    /// Missing keys are not a load error; calls fail with `auth_missing` instead.
    pub api_key: Option<SecretString>,
    pub api_key_header: String,
    pub model: Option<String>,
    pub calls_per_window: u32,
    pub window_secs: u64,
    pub timeout_secs: u64,
    pub max_quota_retries: u32,
    pub quota_backoff_secs: u64,
}

impl ProviderConfig {
    pub fn quota_policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            calls_per_window: self.calls_per_window,
            window: Duration::from_secs(self.window_secs),
            max_attempts: self.max_quota_retries,
            backoff: Duration::from_secs(self.quota_backoff_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_ref().is_some_and(|key| !key.expose_secret().trim().is_empty())
    }

    fn with_kind(kind: ProviderKind) -> Self {
        Self {
            kind,
            base_url: String::new(),
            api_key: None,
            api_key_header: "x-api-key".to_string(),
            model: None,
            calls_per_window: 60,
            window_secs: 60,
            timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs(),
            max_quota_retries: MIN_QUOTA_RETRIES,
            quota_backoff_secs: 60,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RolesConfig {
    /// Provider for clarify, analyze, agent selection, dialogue, evaluation, alignment and synthesis.
    pub llm: String,
    pub deep_research: String,
    pub search: Vec<SearchRoute>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRoute {
    pub channel: SearchChannel,
    pub provider: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompatible,
    JsonSearch,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenaiCompatible => "openai_compatible",
            Self::JsonSearch => "json_search",
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
    pub max_rounds: Option<u32>,
    pub log_level: Option<String>,
    pub llm_provider: Option<String>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
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
        let mut providers = BTreeMap::new();
        providers.insert(
            "llm".to_string(),
            ProviderConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                model: Some("gpt-4o-mini".to_string()),
                ..ProviderConfig::with_kind(ProviderKind::OpenaiCompatible)
            },
        );
        providers.insert(
            "deep_research".to_string(),
            ProviderConfig {
                base_url: "https://api.perplexity.ai".to_string(),
                model: Some("sonar-deep-research".to_string()),
                timeout_secs: 300,
                ..ProviderConfig::with_kind(ProviderKind::OpenaiCompatible)
            },
        );
        for channel in ["web", "academic", "social"] {
            providers.insert(
                channel.to_string(),
                ProviderConfig {
                    base_url: format!("http://127.0.0.1:8787/search/{channel}"),
                    ..ProviderConfig::with_kind(ProviderKind::JsonSearch)
                },
            );
        }

        Self {
            pipeline: PipelineConfig {
                max_rounds: DEFAULT_MAX_ROUNDS,
                search_max_results: 8,
                facts_limit: 20,
            },
            providers,
            roles: RolesConfig {
                llm: "llm".to_string(),
                deep_research: "deep_research".to_string(),
                search: vec![
                    SearchRoute { channel: SearchChannel::Web, provider: "web".to_string() },
                    SearchRoute {
                        channel: SearchChannel::Academic,
                        provider: "academic".to_string(),
                    },
                    SearchRoute { channel: SearchChannel::Social, provider: "social".to_string() },
                ],
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("dialectic.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.get(id)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(pipeline) = patch.pipeline {
            if let Some(max_rounds) = pipeline.max_rounds {
                self.pipeline.max_rounds = max_rounds;
            }
            if let Some(search_max_results) = pipeline.search_max_results {
                self.pipeline.search_max_results = search_max_results;
            }
            if let Some(facts_limit) = pipeline.facts_limit {
                self.pipeline.facts_limit = facts_limit;
            }
        }

        for (id, provider) in patch.providers.unwrap_or_default() {
            let kind = provider.kind.unwrap_or(ProviderKind::OpenaiCompatible);
            let entry =
                self.providers.entry(id).or_insert_with(|| ProviderConfig::with_kind(kind));
            if let Some(kind) = provider.kind {
                entry.kind = kind;
            }
            if let Some(base_url) = provider.base_url {
                entry.base_url = base_url;
            }
            if let Some(api_key_value) = provider.api_key {
                entry.api_key = Some(secret_value(api_key_value));
            }
            if let Some(api_key_header) = provider.api_key_header {
                entry.api_key_header = api_key_header;
            }
            if let Some(model) = provider.model {
                entry.model = Some(model);
            }
            if let Some(calls_per_window) = provider.calls_per_window {
                entry.calls_per_window = calls_per_window;
            }
            if let Some(window_secs) = provider.window_secs {
                entry.window_secs = window_secs;
            }
            if let Some(timeout_secs) = provider.timeout_secs {
                entry.timeout_secs = timeout_secs;
            }
            if let Some(max_quota_retries) = provider.max_quota_retries {
                entry.max_quota_retries = max_quota_retries;
            }
            if let Some(quota_backoff_secs) = provider.quota_backoff_secs {
                entry.quota_backoff_secs = quota_backoff_secs;
            }
        }

        if let Some(roles) = patch.roles {
            if let Some(llm) = roles.llm {
                self.roles.llm = llm;
            }
            if let Some(deep_research) = roles.deep_research {
                self.roles.deep_research = deep_research;
            }
            if let Some(search) = roles.search {
                self.roles.search = search;
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
        if let Some(value) = read_env("DIALECTIC_PIPELINE_MAX_ROUNDS") {
            self.pipeline.max_rounds = parse_u32("DIALECTIC_PIPELINE_MAX_ROUNDS", &value)?;
        }
        if let Some(value) = read_env("DIALECTIC_PIPELINE_SEARCH_MAX_RESULTS") {
            self.pipeline.search_max_results =
                parse_usize("DIALECTIC_PIPELINE_SEARCH_MAX_RESULTS", &value)?;
        }
        if let Some(value) = read_env("DIALECTIC_PIPELINE_FACTS_LIMIT") {
            self.pipeline.facts_limit = parse_usize("DIALECTIC_PIPELINE_FACTS_LIMIT", &value)?;
        }

        for (id, provider) in self.providers.iter_mut() {
            let prefix = format!("DIALECTIC_PROVIDER_{}", env_segment(id));
            if let Some(value) = read_env(&format!("{prefix}_API_KEY")) {
                provider.api_key = Some(secret_value(value));
            }
            if let Some(value) = read_env(&format!("{prefix}_BASE_URL")) {
                provider.base_url = value;
            }
            if let Some(value) = read_env(&format!("{prefix}_MODEL")) {
                provider.model = Some(value);
            }
            let key = format!("{prefix}_TIMEOUT_SECS");
            if let Some(value) = read_env(&key) {
                provider.timeout_secs = parse_u64(&key, &value)?;
            }
        }

        if let Some(value) = read_env("DIALECTIC_ROLES_LLM") {
            self.roles.llm = value;
        }
        if let Some(value) = read_env("DIALECTIC_ROLES_DEEP_RESEARCH") {
            self.roles.deep_research = value;
        }

        if let Some(value) = read_env("DIALECTIC_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DIALECTIC_SERVER_PORT") {
            self.server.port = parse_u16("DIALECTIC_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("DIALECTIC_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("DIALECTIC_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("DIALECTIC_LOGGING_LEVEL").or_else(|| read_env("DIALECTIC_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DIALECTIC_LOGGING_FORMAT").or_else(|| read_env("DIALECTIC_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(max_rounds) = overrides.max_rounds {
            self.pipeline.max_rounds = max_rounds;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.roles.llm = llm_provider;
        }
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_pipeline(&self.pipeline)?;
        for (id, provider) in &self.providers {
            validate_provider(id, provider)?;
        }
        validate_roles(&self.roles, &self.providers)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("dialectic.toml"), PathBuf::from("config/dialectic.toml")]
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

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if !(MIN_ROUNDS..=MAX_ROUNDS).contains(&pipeline.max_rounds) {
        return Err(ConfigError::Validation(format!(
            "pipeline.max_rounds must be in range {MIN_ROUNDS}..={MAX_ROUNDS}"
        )));
    }
    if pipeline.search_max_results == 0 || pipeline.search_max_results > 50 {
        return Err(ConfigError::Validation(
            "pipeline.search_max_results must be in range 1..=50".to_string(),
        ));
    }
    if pipeline.facts_limit == 0 {
        return Err(ConfigError::Validation(
            "pipeline.facts_limit must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_provider(id: &str, provider: &ProviderConfig) -> Result<(), ConfigError> {
    let base_url = provider.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "providers.{id}.base_url must start with http:// or https://"
        )));
    }
    if provider.kind == ProviderKind::OpenaiCompatible
        && provider.model.as_ref().map(|model| model.trim().is_empty()).unwrap_or(true)
    {
        return Err(ConfigError::Validation(format!(
            "providers.{id}.model is required for openai_compatible providers"
        )));
    }
    if provider.calls_per_window == 0 {
        return Err(ConfigError::Validation(format!(
            "providers.{id}.calls_per_window must be greater than zero"
        )));
    }
    if provider.window_secs == 0 {
        return Err(ConfigError::Validation(format!(
            "providers.{id}.window_secs must be greater than zero"
        )));
    }
    if provider.timeout_secs == 0 || provider.timeout_secs > 600 {
        return Err(ConfigError::Validation(format!(
            "providers.{id}.timeout_secs must be in range 1..=600"
        )));
    }
    if !(MIN_QUOTA_RETRIES..=MAX_QUOTA_RETRIES).contains(&provider.max_quota_retries) {
        return Err(ConfigError::Validation(format!(
            "providers.{id}.max_quota_retries must be in range {MIN_QUOTA_RETRIES}..={MAX_QUOTA_RETRIES}"
        )));
    }
    if provider.quota_backoff_secs == 0 {
        return Err(ConfigError::Validation(format!(
            "providers.{id}.quota_backoff_secs must be greater than zero"
        )));
    }
    Ok(())
}

fn validate_roles(
    roles: &RolesConfig,
    providers: &BTreeMap<String, ProviderConfig>,
) -> Result<(), ConfigError> {
    let require_kind = |key: &str, id: &str, kind: ProviderKind| -> Result<(), ConfigError> {
        match providers.get(id) {
            None => Err(ConfigError::Validation(format!(
                "{key} references unknown provider `{id}`"
            ))),
            Some(provider) if provider.kind != kind => Err(ConfigError::Validation(format!(
                "{key} requires a {} provider but `{id}` is {}",
                kind.as_str(),
                provider.kind.as_str()
            ))),
            Some(_) => Ok(()),
        }
    };

    require_kind("roles.llm", &roles.llm, ProviderKind::OpenaiCompatible)?;
    require_kind("roles.deep_research", &roles.deep_research, ProviderKind::OpenaiCompatible)?;

    if roles.search.is_empty() {
        return Err(ConfigError::Validation(
            "roles.search must list at least one search provider".to_string(),
        ));
    }
    for (index, route) in roles.search.iter().enumerate() {
        require_kind(&format!("roles.search[{index}]"), &route.provider, ProviderKind::JsonSearch)?;
        if roles.search[..index].iter().any(|earlier| earlier.channel == route.channel) {
            return Err(ConfigError::Validation(format!(
                "roles.search lists channel `{}` more than once",
                route.channel
            )));
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

fn env_segment(id: &str) -> String {
    id.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch.to_ascii_uppercase() } else { '_' })
        .collect()
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

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    pipeline: Option<PipelinePatch>,
    providers: Option<BTreeMap<String, ProviderPatch>>,
    roles: Option<RolesPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    max_rounds: Option<u32>,
    search_max_results: Option<usize>,
    facts_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderPatch {
    kind: Option<ProviderKind>,
    base_url: Option<String>,
    api_key: Option<String>,
    api_key_header: Option<String>,
    model: Option<String>,
    calls_per_window: Option<u32>,
    window_secs: Option<u64>,
    timeout_secs: Option<u64>,
    max_quota_retries: Option<u32>,
    quota_backoff_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RolesPatch {
    llm: Option<String>,
    deep_research: Option<String>,
    search: Option<Vec<SearchRoute>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
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
    use std::time::Duration;

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, ProviderKind};
    use crate::domain::provider::SearchChannel;

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

    fn write_config(dir: &TempDir, body: &str) -> Result<std::path::PathBuf, String> {
        let path = dir.path().join("dialectic.toml");
        fs::write(&path, body).map_err(|err| err.to_string())?;
        Ok(path)
    }

    #[test]
    fn defaults_validate_without_api_keys() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.pipeline.max_rounds == 3, "default max rounds should be 3")?;
        ensure(config.roles.search.len() == 3, "three search channels by default")?;
        let llm = config.provider("llm").ok_or("llm provider should exist")?;
        ensure(!llm.has_api_key(), "no key configured by default")?;
        ensure(llm.quota_policy().max_attempts == 5, "default quota retry cap is 5")?;
        ensure(
            llm.quota_policy().backoff == Duration::from_secs(60),
            "default quota backoff is 60s",
        )?;
        ensure(matches!(config.logging.format, LogFormat::Compact), "compact by default")
    }

    #[test]
    fn file_load_supports_env_interpolation_and_new_providers() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_DIALECTIC_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = write_config(
                &dir,
                r#"
[providers.llm]
api_key = "${TEST_DIALECTIC_LLM_KEY}"

[providers.scholar]
kind = "json_search"
base_url = "https://scholar.example.com/search"
api_key_header = "x-scholar-key"
calls_per_window = 10

[roles]
search = [
  { channel = "web", provider = "web" },
  { channel = "academic", provider = "scholar" },
]
"#,
            )?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let llm = config.provider("llm").ok_or("llm provider should exist")?;
            ensure(
                llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "llm key should be interpolated from environment",
            )?;
            let scholar = config.provider("scholar").ok_or("scholar provider should exist")?;
            ensure(scholar.kind == ProviderKind::JsonSearch, "scholar is a search provider")?;
            ensure(scholar.calls_per_window == 10, "per-provider window limit applied")?;
            ensure(
                config.roles.search[1].channel == SearchChannel::Academic
                    && config.roles.search[1].provider == "scholar",
                "search routes replaced from file",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_DIALECTIC_LLM_KEY"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DIALECTIC_PIPELINE_MAX_ROUNDS", "7");
        env::set_var("DIALECTIC_PROVIDER_DEEP_RESEARCH_API_KEY", "pplx-from-env");
        env::set_var("DIALECTIC_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = write_config(
                &dir,
                r#"
[pipeline]
max_rounds = 5
facts_limit = 12

[providers.deep_research]
api_key = "pplx-from-file"

[logging]
level = "warn"
"#,
            )?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    log_level: Some("debug".to_string()),
                    port: Some(9090),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.pipeline.max_rounds == 7, "env max rounds should beat the file")?;
            ensure(config.pipeline.facts_limit == 12, "file value kept when env is silent")?;
            ensure(config.logging.level == "debug", "override log level should win")?;
            ensure(config.server.port == 9090, "override port should win")?;
            ensure(matches!(config.logging.format, LogFormat::Json), "env log format alias")?;
            let deep = config.provider("deep_research").ok_or("deep research provider")?;
            ensure(
                deep.api_key.as_ref().map(|key| key.expose_secret() == "pplx-from-env")
                    == Some(true),
                "env api key should win over file",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "DIALECTIC_PIPELINE_MAX_ROUNDS",
            "DIALECTIC_PROVIDER_DEEP_RESEARCH_API_KEY",
            "DIALECTIC_LOG_FORMAT",
        ]);
        result
    }

    #[test]
    fn validation_names_the_offending_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let cases = [
            ("[pipeline]\nmax_rounds = 16\n", "pipeline.max_rounds"),
            ("[providers.llm]\nmax_quota_retries = 3\n", "providers.llm.max_quota_retries"),
            ("[providers.web]\ntimeout_secs = 0\n", "providers.web.timeout_secs"),
            ("[roles]\nllm = \"web\"\n", "roles.llm"),
            ("[roles]\nsearch = []\n", "roles.search"),
        ];

        for (body, key) in cases {
            let path = write_config(&dir, body)?;
            let error = match AppConfig::load(LoadOptions {
                config_path: Some(path),
                ..LoadOptions::default()
            }) {
                Ok(_) => return Err(format!("expected validation failure for `{key}`")),
                Err(error) => error,
            };
            let names_key =
                matches!(error, ConfigError::Validation(ref message) if message.contains(key));
            if !names_key {
                return Err(format!("validation error should mention `{key}`, got {error}"));
            }
        }
        Ok(())
    }

    #[test]
    fn missing_required_file_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;

        let error = AppConfig::load(LoadOptions {
            config_path: Some(dir.path().join("absent.toml")),
            require_file: true,
            ..LoadOptions::default()
        });

        ensure(matches!(error, Err(ConfigError::MissingConfigFile(_))), "missing file error")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DIALECTIC_PROVIDER_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                config.provider("llm").map(|provider| provider.has_api_key()) == Some(true),
                "key should still be loaded",
            )
        })();

        clear_vars(&["DIALECTIC_PROVIDER_LLM_API_KEY"]);
        result
    }
}
