use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dialectic_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct FieldSources<'a> {
    doc: Option<&'a Value>,
    path: Option<&'a Path>,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let sources =
        FieldSources { doc: config_file_doc.as_ref(), path: config_file_path.as_deref() };

    render(&config, &sources).join("\n")
}

fn render(config: &AppConfig, sources: &FieldSources<'_>) -> Vec<String> {
    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(sources.line(
        "pipeline.max_rounds",
        &config.pipeline.max_rounds.to_string(),
        &["DIALECTIC_PIPELINE_MAX_ROUNDS"],
    ));
    lines.push(sources.line(
        "pipeline.search_max_results",
        &config.pipeline.search_max_results.to_string(),
        &["DIALECTIC_PIPELINE_SEARCH_MAX_RESULTS"],
    ));
    lines.push(sources.line(
        "pipeline.facts_limit",
        &config.pipeline.facts_limit.to_string(),
        &["DIALECTIC_PIPELINE_FACTS_LIMIT"],
    ));

    lines.push(sources.line("roles.llm", &config.roles.llm, &["DIALECTIC_ROLES_LLM"]));
    lines.push(sources.line(
        "roles.deep_research",
        &config.roles.deep_research,
        &["DIALECTIC_ROLES_DEEP_RESEARCH"],
    ));
    let search_routes = config
        .roles
        .search
        .iter()
        .map(|route| format!("{}={}", route.channel.as_str(), route.provider))
        .collect::<Vec<_>>()
        .join(", ");
    lines.push(sources.line("roles.search", &search_routes, &[]));

    for (id, provider) in &config.providers {
        let prefix = format!("DIALECTIC_PROVIDER_{}", env_segment(id));
        let key = |field: &str| format!("providers.{id}.{field}");
        let env_key = |field: &str| format!("{prefix}_{field}");

        lines.push(sources.line(&key("kind"), provider.kind.as_str(), &[]));
        lines.push(sources.line(
            &key("base_url"),
            &provider.base_url,
            &[env_key("BASE_URL").as_str()],
        ));
        lines.push(sources.line(
            &key("model"),
            provider.model.as_deref().unwrap_or("<unset>"),
            &[env_key("MODEL").as_str()],
        ));
        let api_key = provider
            .api_key
            .as_ref()
            .map(|secret| redact_token(secret.expose_secret()))
            .unwrap_or_else(|| "<unset>".to_string());
        lines.push(sources.line(&key("api_key"), &api_key, &[env_key("API_KEY").as_str()]));
        lines.push(sources.line(
            &key("timeout_secs"),
            &provider.timeout_secs.to_string(),
            &[env_key("TIMEOUT_SECS").as_str()],
        ));
        lines.push(sources.line(
            &key("calls_per_window"),
            &format!("{} per {}s", provider.calls_per_window, provider.window_secs),
            &[],
        ));
        lines.push(sources.line(
            &key("max_quota_retries"),
            &provider.max_quota_retries.to_string(),
            &[],
        ));
    }

    lines.push(sources.line(
        "server.bind_address",
        &config.server.bind_address,
        &["DIALECTIC_SERVER_BIND_ADDRESS"],
    ));
    lines.push(sources.line(
        "server.port",
        &config.server.port.to_string(),
        &["DIALECTIC_SERVER_PORT"],
    ));
    lines.push(sources.line(
        "server.graceful_shutdown_secs",
        &config.server.graceful_shutdown_secs.to_string(),
        &["DIALECTIC_SERVER_GRACEFUL_SHUTDOWN_SECS"],
    ));

    lines.push(sources.line(
        "logging.level",
        &config.logging.level,
        &["DIALECTIC_LOGGING_LEVEL", "DIALECTIC_LOG_LEVEL"],
    ));
    lines.push(sources.line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        &["DIALECTIC_LOGGING_FORMAT", "DIALECTIC_LOG_FORMAT"],
    ));

    lines
}

impl FieldSources<'_> {
    fn line(&self, key_path: &str, value: &str, env_keys: &[&str]) -> String {
        format!("- {key_path} = {value} (source: {})", self.source(key_path, env_keys))
    }

    fn source(&self, key_path: &str, env_keys: &[&str]) -> String {
        if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
            return format!("env ({env_key})");
        }

        if let Some(doc) = self.doc {
            if contains_path(doc, key_path) {
                let file_path = self
                    .path
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "config file".to_string());
                return format!("file ({file_path})");
            }
        }

        "default".to_string()
    }
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("dialectic.toml"), PathBuf::from("config/dialectic.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn env_segment(id: &str) -> String {
    id.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use super::{contains_path, env_segment, redact_token};

    #[test]
    fn redaction_keeps_only_the_key_prefix() {
        assert_eq!(redact_token("sk-live-abcdef"), "sk-***");
        assert_eq!(redact_token("abcdef"), "<redacted>");
        assert_eq!(redact_token("   "), "<empty>");
    }

    #[test]
    fn provider_ids_map_to_env_segments() {
        assert_eq!(env_segment("deep_research"), "DEEP_RESEARCH");
        assert_eq!(env_segment("web-search"), "WEB_SEARCH");
    }

    #[test]
    fn nested_provider_keys_are_found_in_file_doc() {
        let doc: toml::Value = "[providers.llm]\nmodel = \"gpt-4o\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "providers.llm.model"));
        assert!(!contains_path(&doc, "providers.llm.base_url"));
    }
}
