use std::{env, net::SocketAddr};

use serde_json::Value;
use thiserror::Error;

use crate::models::ModelConfig;

const DEFAULT_ADDR: &str = "127.0.0.1:7860";
const DEFAULT_ENGINE: &str = "openai";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CHATWAYS_ADDR is not a socket address: {0}")]
    Addr(String),
    #[error("CHATWAYS_MODEL_CONFIG is not valid JSON: {0}")]
    ModelConfigJson(#[from] serde_json::Error),
    #[error("CHATWAYS_MODEL_CONFIG must be a JSON object")]
    ModelConfigShape,
}

/// Process settings, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub addr: SocketAddr,
    pub engine: String,
    pub model: Option<String>,
    pub model_config: Option<ModelConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let addr_text = read("CHATWAYS_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_owned());
        let addr = addr_text
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Addr(addr_text.clone()))?;

        let model_config = match read("CHATWAYS_MODEL_CONFIG") {
            None => None,
            Some(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => Some(map),
                _ => return Err(ConfigError::ModelConfigShape),
            },
        };

        Ok(Self {
            addr,
            engine: read("CHATWAYS_ENGINE").unwrap_or_else(|| DEFAULT_ENGINE.to_owned()),
            model: read("CHATWAYS_MODEL"),
            model_config,
        })
    }
}
