use serde::{Deserialize, Serialize};

pub const GPTSCRIPT_URL_ENV: &str = "GPTSCRIPT_URL";
pub const GPTSCRIPT_TOKEN_ENV: &str = "GPTSCRIPT_TOKEN";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_URL_ENV: &str = "OPENAI_BASE_URL";
pub const DEFAULT_MODEL_ENV: &str = "GPTSCRIPT_SDKSERVER_DEFAULT_MODEL";
pub const DEFAULT_MODEL_PROVIDER_ENV: &str = "GPTSCRIPT_SDKSERVER_DEFAULT_MODEL_PROVIDER";
pub const CACHE_DIR_ENV: &str = "GPTSCRIPT_CACHE_DIR";

pub fn non_empty_env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn prefer(override_value: &str, base: &str) -> String {
    if override_value.is_empty() {
        base.to_string()
    } else {
        override_value.to_string()
    }
}

/// Looks up `key` in a `KEY=value` list. The first entry wins.
pub fn env_lookup<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| {
        let (name, value) = entry.split_once('=')?;
        (name == key).then_some(value)
    })
}

/// Resolves a `KEY=value` list into pairs, keeping the first entry for each
/// key and dropping entries without `=`.
pub fn env_pairs(env: &[String]) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::with_capacity(env.len());
    for entry in env {
        let Some((name, value)) = entry.split_once('=') else {
            continue;
        };
        if pairs.iter().any(|(existing, _)| existing == name) {
            continue;
        }
        pairs.push((name.to_string(), value.to_string()));
    }
    pairs
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
/// Connection and engine-wide defaults shared by every run of a client.
pub struct GlobalOptions {
    #[serde(rename = "URL", skip_serializing)]
    pub url: String,
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub default_model_provider: String,
    pub default_model: String,
    pub cache_dir: String,
    pub env: Vec<String>,
    pub dataset_tool_repo: String,
    pub workspace_tool: String,
}

impl GlobalOptions {
    /// Defaults read from the process environment.
    pub fn from_env() -> Self {
        Self {
            url: non_empty_env_var(GPTSCRIPT_URL_ENV).unwrap_or_default(),
            token: non_empty_env_var(GPTSCRIPT_TOKEN_ENV).unwrap_or_default(),
            api_key: non_empty_env_var(OPENAI_API_KEY_ENV).unwrap_or_default(),
            base_url: non_empty_env_var(OPENAI_BASE_URL_ENV).unwrap_or_default(),
            default_model_provider: non_empty_env_var(DEFAULT_MODEL_PROVIDER_ENV)
                .unwrap_or_default(),
            default_model: non_empty_env_var(DEFAULT_MODEL_ENV).unwrap_or_default(),
            cache_dir: non_empty_env_var(CACHE_DIR_ENV).unwrap_or_default(),
            ..Self::default()
        }
    }

    /// Field-wise merge where non-empty values in `other` win and env lists
    /// are concatenated with `other` first.
    pub fn merge(&self, other: &GlobalOptions) -> GlobalOptions {
        GlobalOptions {
            url: prefer(&other.url, &self.url),
            token: prefer(&other.token, &self.token),
            api_key: prefer(&other.api_key, &self.api_key),
            base_url: prefer(&other.base_url, &self.base_url),
            default_model_provider: prefer(
                &other.default_model_provider,
                &self.default_model_provider,
            ),
            default_model: prefer(&other.default_model, &self.default_model),
            cache_dir: prefer(&other.cache_dir, &self.cache_dir),
            env: other.env.iter().chain(self.env.iter()).cloned().collect(),
            dataset_tool_repo: prefer(&other.dataset_tool_repo, &self.dataset_tool_repo),
            workspace_tool: prefer(&other.workspace_tool, &self.workspace_tool),
        }
    }

    /// Environment for the engine process: the configured list (or the
    /// current process environment when empty) plus model settings.
    pub fn to_env(&self) -> Vec<String> {
        let mut env = if self.env.is_empty() {
            std::env::vars()
                .map(|(key, value)| format!("{key}={value}"))
                .collect()
        } else {
            self.env.clone()
        };
        if !self.api_key.is_empty() {
            env.push(format!("{OPENAI_API_KEY_ENV}={}", self.api_key));
        }
        if !self.base_url.is_empty() {
            env.push(format!("{OPENAI_BASE_URL_ENV}={}", self.base_url));
        }
        if !self.default_model.is_empty() {
            env.push(format!("{DEFAULT_MODEL_ENV}={}", self.default_model));
        }
        if !self.default_model_provider.is_empty() {
            env.push(format!(
                "{DEFAULT_MODEL_PROVIDER_ENV}={}",
                self.default_model_provider
            ));
        }
        env
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
/// Per-run options. Serialized into the body of every run request.
pub struct Options {
    #[serde(flatten)]
    pub global: GlobalOptions,
    pub input: String,
    pub disable_cache: bool,
    pub sub_tool: String,
    pub workspace: String,
    pub chat_state: String,
    pub confirm: bool,
    pub prompt: bool,
    pub credential_overrides: Vec<String>,
    pub credential_contexts: Vec<String>,
    pub location: String,
    pub force_sequential: bool,
}

impl Options {
    /// Layers these options over `global`; per-run values win when set.
    pub fn merge_global(&self, global: &GlobalOptions) -> Options {
        Options {
            global: global.merge(&self.global),
            ..self.clone()
        }
    }
}
