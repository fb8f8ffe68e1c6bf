use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::error::BridgeError;
use crate::sanitize::mask_secret;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;

const ENV_MODELS: &str = "AZURE_OPENAI_MODELS";
const ENV_ENDPOINT: &str = "AZURE_OPENAI_ENDPOINT";
const ENV_API_KEY: &str = "AZURE_OPENAI_API_KEY";
const ENV_DEPLOYMENT: &str = "AZURE_OPENAI_DEPLOYMENT";
const ENV_DEPLOYMENT_NAME: &str = "AZURE_OPENAI_DEPLOYMENT_NAME";
const ENV_API_VERSION: &str = "AZURE_OPENAI_API_VERSION";
const ENV_MODEL_TYPE: &str = "AZURE_OPENAI_MODEL_TYPE";
const ENV_MODEL: &str = "AZURE_OPENAI_MODEL";

/// Which Azure OpenAI surface a model is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// `/openai/deployments/{deployment}/chat/completions`
    #[default]
    Chat,
    /// `/openai/responses` (structured input/output items)
    #[serde(alias = "alternate", alias = "codex")]
    Responses,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Chat => "chat",
            BackendMode::Responses => "responses",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "completions" | "chat_completions" => Some(BackendMode::Chat),
            "responses" | "response" | "alternate" | "codex" => Some(BackendMode::Responses),
            _ => None,
        }
    }

    pub fn default_api_version(&self) -> &'static str {
        match self {
            BackendMode::Chat => "2024-10-21",
            BackendMode::Responses => "2025-04-01-preview",
        }
    }

    /// Heuristic used when no mode is configured: codex-family deployments only speak the
    /// responses API.
    pub fn infer(model: &str, deployment: Option<&str>) -> Self {
        let hit = |s: &str| s.to_ascii_lowercase().contains("codex");
        if hit(model) || deployment.is_some_and(hit) {
            BackendMode::Responses
        } else {
            BackendMode::Chat
        }
    }
}

/// One model entry as written in config files or the `AZURE_OPENAI_MODELS` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "apiKey",
        alias = "key"
    )]
    pub api_key: Option<String>,
    /// Environment variable name holding the key (preferred over storing secrets on disk)
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "apiKeyEnv")]
    pub api_key_env: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "deployment_name",
        alias = "deploymentName"
    )]
    pub deployment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "apiVersion")]
    pub api_version: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "type",
        alias = "model_type"
    )]
    pub mode: Option<BackendMode>,
}

impl ModelConfig {
    fn resolve_api_key(&self, env: &EnvSnapshot) -> Option<String> {
        if let Some(key) = self.api_key.as_deref()
            && !key.trim().is_empty()
        {
            return Some(key.trim().to_string());
        }
        if let Some(env_name) = self.api_key_env.as_deref()
            && let Some(v) = env.get(env_name)
        {
            return Some(v.to_string());
        }
        None
    }

    pub fn effective_mode(&self, model: &str) -> BackendMode {
        self.mode
            .unwrap_or_else(|| BackendMode::infer(model, self.deployment.as_deref()))
    }

    /// Turn this entry into a request-scoped descriptor, validating every required field.
    pub fn to_descriptor(
        &self,
        model: &str,
        env: &EnvSnapshot,
    ) -> Result<BackendDescriptor, BridgeError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::Config(format!("missing endpoint for model '{model}'")))?;
        let endpoint = validate_endpoint(endpoint)
            .map_err(|e| BridgeError::Config(format!("invalid endpoint for model '{model}': {e}")))?;
        let api_key = self
            .resolve_api_key(env)
            .ok_or_else(|| BridgeError::Config(format!("missing api key for model '{model}'")))?;
        let deployment = self
            .deployment
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                BridgeError::Config(format!("missing deployment for model '{model}'"))
            })?
            .to_string();
        let mode = self.effective_mode(model);
        let api_version = self
            .api_version
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(mode.default_api_version())
            .to_string();
        Ok(BackendDescriptor {
            endpoint,
            api_key,
            deployment,
            api_version,
            mode,
        })
    }

    /// Copy with credentials masked, for display.
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        out.api_key = out.api_key.as_deref().map(mask_secret);
        out
    }
}

/// Accepts absolute http(s) URLs only; returns the endpoint without trailing slashes.
pub fn validate_endpoint(endpoint: &str) -> std::result::Result<String, String> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let url = reqwest::Url::parse(trimmed).map_err(|e| e.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err("missing host".to_string());
    }
    Ok(trimmed.to_string())
}

/// Everything needed to reach one Azure deployment; fixed for the lifetime of a request.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
    pub mode: BackendMode,
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("endpoint", &self.endpoint)
            .field("api_key", &mask_secret(&self.api_key))
            .field("deployment", &self.deployment)
            .field("api_version", &self.api_version)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Where a model's configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    EnvTable,
    EnvSingle,
    File,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::EnvTable => "env:AZURE_OPENAI_MODELS",
            ConfigSource::EnvSingle => "env:AZURE_OPENAI_*",
            ConfigSource::File => "config file",
        }
    }
}

/// Process environment captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    #[cfg(test)]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Trimmed, non-empty value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn model_table(&self) -> BTreeMap<String, ModelConfig> {
        let Some(raw) = self.get(ENV_MODELS) else {
            return BTreeMap::new();
        };
        match serde_json::from_str::<BTreeMap<String, ModelConfig>>(raw) {
            Ok(table) => table,
            Err(err) => {
                warn!("ignoring {ENV_MODELS}: not a JSON model table ({err})");
                BTreeMap::new()
            }
        }
    }

    /// The single-model fallback and the model name it is restricted to (if any).
    ///
    /// Built only when endpoint, key and deployment are all set; a partial set falls through to
    /// the file table.
    fn single_model(&self) -> Option<(Option<String>, ModelConfig)> {
        let endpoint = self.get(ENV_ENDPOINT);
        let api_key = self.get(ENV_API_KEY);
        let deployment = self
            .get(ENV_DEPLOYMENT)
            .or_else(|| self.get(ENV_DEPLOYMENT_NAME));
        let (Some(endpoint), Some(api_key), Some(deployment)) = (endpoint, api_key, deployment)
        else {
            return None;
        };
        let mode = self.get(ENV_MODEL_TYPE).and_then(|t| {
            let parsed = BackendMode::parse(t);
            if parsed.is_none() {
                warn!("ignoring {ENV_MODEL_TYPE}={t}: expected 'chat' or 'responses'");
            }
            parsed
        });
        let cfg = ModelConfig {
            endpoint: Some(endpoint.to_string()),
            api_key: Some(api_key.to_string()),
            api_key_env: None,
            deployment: Some(deployment.to_string()),
            api_version: self.get(ENV_API_VERSION).map(str::to_string),
            mode,
        };
        Some((self.get(ENV_MODEL).map(str::to_string), cfg))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Write runtime logs to `<home>/logs/runtime.log` instead of stderr.
    #[serde(default)]
    pub file: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    /// Optional config schema version for future migrations
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Persisted model table: requested model name -> backend entry.
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

impl ProxyConfig {
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        for entry in out.models.values_mut() {
            *entry = entry.masked();
        }
        out
    }
}

/// Find the entry for `model`: env table, then env single-model fallback, then the file table.
pub fn lookup_model(
    model: &str,
    env: &EnvSnapshot,
    file: &ProxyConfig,
) -> Option<(ConfigSource, ModelConfig)> {
    if let Some(cfg) = env.model_table().remove(model) {
        return Some((ConfigSource::EnvTable, cfg));
    }
    if let Some((only_for, cfg)) = env.single_model()
        && only_for.as_deref().is_none_or(|name| name == model)
    {
        return Some((ConfigSource::EnvSingle, cfg));
    }
    file.models
        .get(model)
        .cloned()
        .map(|cfg| (ConfigSource::File, cfg))
}

pub fn resolve_backend(
    model: &str,
    env: &EnvSnapshot,
    file: &ProxyConfig,
) -> Result<BackendDescriptor, BridgeError> {
    let (_, cfg) = lookup_model(model, env, file)
        .ok_or_else(|| BridgeError::Config(format!("model '{model}' is not configured")))?;
    cfg.to_descriptor(model, env)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelListing {
    pub id: String,
    pub source: ConfigSource,
    pub mode: BackendMode,
}

/// All model names known across the three layers, first layer wins on duplicates.
pub fn list_models(env: &EnvSnapshot, file: &ProxyConfig) -> Vec<ModelListing> {
    let mut out: Vec<ModelListing> = Vec::new();
    let mut push = |id: &str, source: ConfigSource, cfg: &ModelConfig| {
        if !out.iter().any(|m| m.id == id) {
            out.push(ModelListing {
                id: id.to_string(),
                source,
                mode: cfg.effective_mode(id),
            });
        }
    };

    for (name, cfg) in env.model_table().iter() {
        push(name, ConfigSource::EnvTable, cfg);
    }
    if let Some((only_for, cfg)) = env.single_model()
        && let Some(name) = only_for.as_deref().or(cfg.deployment.as_deref())
    {
        push(name, ConfigSource::EnvSingle, &cfg);
    }
    for (name, cfg) in file.models.iter() {
        push(name, ConfigSource::File, cfg);
    }
    out
}

/// Human-readable problems for models that would fail to resolve at request time.
pub fn config_warnings(env: &EnvSnapshot, file: &ProxyConfig) -> Vec<String> {
    list_models(env, file)
        .into_iter()
        .filter_map(|m| {
            let (_, cfg) = lookup_model(&m.id, env, file)?;
            cfg.to_descriptor(&m.id, env)
                .err()
                .map(|e| format!("[{}] {}", m.source.as_str(), e))
        })
        .collect()
}

fn config_dir() -> PathBuf {
    proxy_home_dir()
}

fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

fn config_toml_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn config_toml_backup_path() -> PathBuf {
    config_dir().join("config.toml.bak")
}

/// Return the primary config file path that will be used by `load_config()`.
pub fn config_file_path() -> PathBuf {
    let toml_path = config_toml_path();
    if toml_path.exists() {
        toml_path
    } else if config_path().exists() {
        config_path()
    } else {
        toml_path
    }
}

const CONFIG_VERSION: u32 = 1;

fn ensure_config_version(cfg: &mut ProxyConfig) {
    if cfg.version.is_none() {
        cfg.version = Some(CONFIG_VERSION);
    }
}

const CONFIG_TOML_DOC_HEADER: &str = r#"# azure-openai-bridge config.toml
#
# Models resolve in this order: AZURE_OPENAI_MODELS (env JSON table), then the
# AZURE_OPENAI_ENDPOINT / _API_KEY / _DEPLOYMENT fallback, then [models.*] below.
#
# Prefer `api_key_env` over an inline `api_key` so secrets stay out of this file.
"#;

const CONFIG_TOML_TEMPLATE_BODY: &str = r#"version = 1

[server]
host = "127.0.0.1"
port = 3000

[logging]
file = false

# [models.gpt-4o]
# endpoint = "https://my-resource.openai.azure.com"
# api_key_env = "AZURE_OPENAI_API_KEY"
# deployment = "gpt-4o"
# api_version = "2024-10-21"
# mode = "chat"
#
# [models.codex-mini]
# endpoint = "https://my-resource.openai.azure.com"
# api_key_env = "AZURE_OPENAI_API_KEY"
# deployment = "codex-mini"
# mode = "responses"
"#;

/// Write a commented template to `config.toml`.
pub async fn init_config_toml(force: bool) -> Result<PathBuf> {
    let dir = config_dir();
    fs::create_dir_all(&dir).await?;
    let path = config_toml_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config.toml already exists at {:?}; use --force to overwrite",
            path
        );
    }
    if path.exists()
        && let Err(err) = fs::copy(&path, config_toml_backup_path()).await
    {
        warn!("failed to backup {:?}: {}", path, err);
    }
    let text = format!("{CONFIG_TOML_DOC_HEADER}\n{CONFIG_TOML_TEMPLATE_BODY}");
    let tmp_path = dir.join("config.toml.tmp");
    fs::write(&tmp_path, text).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(path)
}

pub async fn load_config() -> Result<ProxyConfig> {
    let toml_path = config_toml_path();
    if toml_path.exists() {
        let text = fs::read_to_string(&toml_path)
            .await
            .with_context(|| format!("reading {:?}", toml_path))?;
        let mut cfg = toml::from_str::<ProxyConfig>(&text)
            .with_context(|| format!("parsing {:?}", toml_path))?;
        ensure_config_version(&mut cfg);
        normalize_proxy_config(&mut cfg);
        return Ok(cfg);
    }

    let json_path = config_path();
    if json_path.exists() {
        let bytes = fs::read(&json_path).await?;
        let mut cfg = serde_json::from_slice::<ProxyConfig>(&bytes)
            .with_context(|| format!("parsing {:?}", json_path))?;
        ensure_config_version(&mut cfg);
        normalize_proxy_config(&mut cfg);
        return Ok(cfg);
    }

    let mut cfg = ProxyConfig::default();
    ensure_config_version(&mut cfg);
    Ok(cfg)
}

pub async fn save_config(cfg: &ProxyConfig) -> Result<PathBuf> {
    let mut cfg = cfg.clone();
    ensure_config_version(&mut cfg);
    normalize_proxy_config(&mut cfg);

    let dir = config_dir();
    fs::create_dir_all(&dir).await?;
    let path = config_toml_path();
    let body = toml::to_string_pretty(&cfg)?;
    let text = format!("{CONFIG_TOML_DOC_HEADER}\n{body}");

    // Keep the previous file around, then write to a temp file and rename over the original.
    if path.exists()
        && let Err(err) = fs::copy(&path, config_toml_backup_path()).await
    {
        warn!("failed to backup {:?}: {}", path, err);
    }

    let tmp_path = dir.join("config.tmp");
    fs::write(&tmp_path, text.as_bytes()).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(path)
}

fn normalize_proxy_config(cfg: &mut ProxyConfig) {
    let models = std::mem::take(&mut cfg.models);
    cfg.models = models
        .into_iter()
        .filter_map(|(name, mut entry)| {
            let name = name.trim().to_string();
            if name.is_empty() {
                return None;
            }
            if let Some(ep) = entry.endpoint.as_mut() {
                *ep = ep.trim().trim_end_matches('/').to_string();
            }
            Some((name, entry))
        })
        .collect();
}

/// Home directory for config and logs.
pub fn proxy_home_dir() -> PathBuf {
    if let Ok(dir) = env::var("AZURE_OPENAI_BRIDGE_HOME") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    #[cfg(test)]
    {
        static TEST_HOME: std::sync::OnceLock<PathBuf> = std::sync::OnceLock::new();
        TEST_HOME
            .get_or_init(|| {
                let mut dir = std::env::temp_dir();
                let unique = format!(
                    "azure-openai-bridge-test-{}-{}",
                    std::process::id(),
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_nanos())
                        .unwrap_or(0)
                );
                dir.push(unique);
                dir.push(".azure-openai-bridge");
                let _ = std::fs::create_dir_all(&dir);
                dir
            })
            .clone()
    }

    #[cfg(not(test))]
    {
        home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".azure-openai-bridge")
    }
}
