use std::collections::HashMap;

use anyhow::{bail, Result};

/// Full application configuration. The API key comes from env/.env
/// only; everything else has a sensible default.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub chat_url: String,
    pub chat_model: String,
    pub embed_url: String,
    pub embed_model: String,

    pub bind: String,
    pub port: u16,
    /// "development" | "production"; production binds all interfaces.
    pub env: String,
    pub data_dir: String,

    /// Outstanding chunk-analysis requests, clamped to 3..=4.
    pub map_concurrency: usize,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let api_key = get_str("LLM_API_KEY", &dotenv, "");
        if api_key.is_empty() {
            bail!("LLM_API_KEY is not set (env or .env)");
        }

        Ok(Config {
            api_key,
            chat_url: get_str(
                "LLM_CHAT_URL",
                &dotenv,
                "https://api.deepseek.com/v1/chat/completions",
            ),
            chat_model: get_str("LLM_CHAT_MODEL", &dotenv, "deepseek-chat"),
            embed_url: get_str(
                "LLM_EMBED_URL",
                &dotenv,
                "https://dashscope.aliyuncs.com/compatible-mode/v1/embeddings",
            ),
            embed_model: get_str("LLM_EMBED_MODEL", &dotenv, "text-embedding-v3"),
            bind: get_str("BIND", &dotenv, ""),
            port: get_u16("PORT", &dotenv, 3030),
            env: get_str("APP_ENV", &dotenv, "development"),
            data_dir: get_str("DATA_DIR", &dotenv, "store"),
            map_concurrency: get_usize("MAP_CONCURRENCY", &dotenv, 3).clamp(3, 4),
        })
    }

    /// Explicit BIND wins; otherwise production exposes all interfaces
    /// and everything else stays on loopback.
    pub fn bind_addr(&self) -> String {
        let host = if !self.bind.is_empty() {
            self.bind.clone()
        } else if self.env == "production" {
            "0.0.0.0".into()
        } else {
            "127.0.0.1".into()
        };
        format!("{host}:{}", self.port)
    }
}
