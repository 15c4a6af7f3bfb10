use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::Author;

const DEFAULT_ENV_PREFIX: &str = "COMMENT_THREAD";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub thread: ThreadConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Empty selects the in-memory demo backend.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user_agent: default_user_agent(),
            token: None,
            timeout: default_timeout(),
        }
    }
}

fn default_user_agent() -> String {
    format!("comment-thread/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            display_name: default_display_name(),
            avatar: None,
        }
    }
}

impl IdentityConfig {
    pub fn author(&self) -> Author {
        Author {
            id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

fn default_user_id() -> String {
    "me".into()
}

fn default_display_name() -> String {
    "Me".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_reply_page_size")]
    pub reply_page_size: usize,
    #[serde(default = "default_background")]
    pub background: bool,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            reply_page_size: default_reply_page_size(),
            background: default_background(),
        }
    }
}

fn default_page_size() -> usize {
    20
}

fn default_reply_page_size() -> usize {
    10
}

fn default_background() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.api.base_url.is_empty() {
        base.api.base_url = other.api.base_url;
    }
    if !other.api.user_agent.is_empty() {
        base.api.user_agent = other.api.user_agent;
    }
    if other.api.token.is_some() {
        base.api.token = other.api.token;
    }
    if !other.api.timeout.is_zero() {
        base.api.timeout = other.api.timeout;
    }

    if !other.identity.user_id.is_empty() {
        base.identity.user_id = other.identity.user_id;
    }
    if !other.identity.display_name.is_empty() {
        base.identity.display_name = other.identity.display_name;
    }
    if other.identity.avatar.is_some() {
        base.identity.avatar = other.identity.avatar;
    }

    if other.thread.page_size != 0 {
        base.thread.page_size = other.thread.page_size;
    }
    if other.thread.reply_page_size != 0 {
        base.thread.reply_page_size = other.thread.reply_page_size;
    }
    base.thread.background = other.thread.background;

    if !other.log.filter.is_empty() {
        base.log.filter = other.log.filter;
    }

    base
}

/// Applies `<PREFIX>_SECTION__KEY` variables on top of `cfg`.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.token" => cfg.api.token = Some(value),
        "api.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.api.timeout = duration;
            }
        }
        "identity.user_id" => cfg.identity.user_id = value,
        "identity.display_name" => cfg.identity.display_name = value,
        "identity.avatar" => cfg.identity.avatar = Some(value),
        "thread.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.thread.page_size = parsed;
            }
        }
        "thread.reply_page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.thread.reply_page_size = parsed;
            }
        }
        "thread.background" => {
            cfg.thread.background = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        "log.filter" => cfg.log.filter = value,
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("comment-thread").join("config.yaml"))
}
