use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "chimein_config.toml";

/// Process-level settings of the backend. The engagement settings an operator
/// changes at runtime (channels, frequency, gap) live in the database instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Model for the join/no-join call; falls back to `llm_model`.
    #[serde(default)]
    pub reasoning_model: Option<String>,
    /// Model for in-character generation; falls back to `llm_model`.
    #[serde(default)]
    pub generation_model: Option<String>,

    // Retrieval service, empty disables knowledge augmentation
    #[serde(default)]
    pub retrieval_api_url: String,

    // Discord transport
    #[serde(default)]
    pub discord_bot_token: String,
    #[serde(default = "default_webhook_name")]
    pub discord_webhook_name: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Scheduling
    #[serde(default = "default_true")]
    pub enable_scheduler: bool,
    #[serde(default = "default_scheduler_recheck_secs")]
    pub scheduler_recheck_secs: u64,
    #[serde(default = "default_run_lease_secs")]
    pub run_lease_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_webhook_name() -> String {
    "chimein".to_string()
}

fn default_database_path() -> String {
    "chimein.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_scheduler_recheck_secs() -> u64 {
    60
}

fn default_run_lease_secs() -> u64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            reasoning_model: None,
            generation_model: None,
            retrieval_api_url: String::new(),
            discord_bot_token: String::new(),
            discord_webhook_name: default_webhook_name(),
            database_path: default_database_path(),
            enable_scheduler: true,
            scheduler_recheck_secs: default_scheduler_recheck_secs(),
            run_lease_secs: default_run_lease_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl BackendConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Load config from chimein_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if path.exists() {
            match Self::load_from(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("{:#}", e);
                }
            }
        }

        tracing::warn!("No usable config file, using defaults + env vars");
        Self::from_env()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        toml::from_str::<BackendConfig>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(model) = env::var("REASONING_MODEL") {
            if !model.trim().is_empty() {
                config.reasoning_model = Some(model);
            }
        }

        if let Ok(model) = env::var("GENERATION_MODEL") {
            if !model.trim().is_empty() {
                config.generation_model = Some(model);
            }
        }

        if let Ok(url) = env::var("RETRIEVAL_API_URL") {
            config.retrieval_api_url = url;
        }

        if let Ok(token) = env::var("DISCORD_BOT_TOKEN") {
            config.discord_bot_token = token;
        }

        if let Ok(name) = env::var("DISCORD_WEBHOOK_NAME") {
            if !name.trim().is_empty() {
                config.discord_webhook_name = name;
            }
        }

        if let Ok(path) = env::var("CHIMEIN_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(enabled) = env::var("CHIMEIN_ENABLE_SCHEDULER") {
            config.enable_scheduler = parse_flag(&enabled);
        }

        if let Ok(secs) = env::var("CHIMEIN_SCHEDULER_RECHECK_SECS") {
            if let Ok(secs) = secs.parse() {
                config.scheduler_recheck_secs = secs;
            }
        }

        if let Ok(secs) = env::var("CHIMEIN_RUN_LEASE_SECS") {
            if let Ok(secs) = secs.parse() {
                config.run_lease_secs = secs;
            }
        }

        if let Ok(secs) = env::var("CHIMEIN_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.request_timeout_secs = secs;
            }
        }

        config
    }

    pub fn reasoning_model(&self) -> &str {
        non_empty(self.reasoning_model.as_deref()).unwrap_or(self.llm_model.as_str())
    }

    pub fn generation_model(&self) -> &str {
        non_empty(self.generation_model.as_deref()).unwrap_or(self.llm_model.as_str())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}
