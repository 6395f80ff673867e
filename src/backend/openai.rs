use std::{env, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    backend::{BackendError, ChatModel, ResponseStream},
    models::{GenerationConfig, Message, ModelConfig},
};

pub const ENGINE: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const FLOAT_PARAMETERS: [&str; 4] = [
    "temperature",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
];

/// Chat model served by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiChatModel {
    client: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiChatModel {
    /// Builds the client from `api_key`, `base_url` and `timeout_secs` in the
    /// model config, falling back to `OPENAI_API_KEY`, `OPENAI_BASE_URL` and
    /// `OPENAI_TIMEOUT_SECS`.
    pub fn new(model: Option<String>, config: ModelConfig) -> Result<Self, BackendError> {
        let api_key = config_string(&config, "api_key")?
            .or_else(|| env::var("OPENAI_API_KEY").ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                BackendError::ModelLoad(
                    "no API key: set `api_key` in the model config or OPENAI_API_KEY".to_owned(),
                )
            })?;
        let base_url = config_string(&config, "base_url")?
            .or_else(|| env::var("OPENAI_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let timeout_secs = match config.get("timeout_secs") {
            Some(value) => value.as_u64().ok_or_else(|| {
                BackendError::ModelLoad(format!("timeout_secs must be an unsigned integer, got {value}"))
            })?,
            None => env::var("OPENAI_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|error| {
                BackendError::ModelLoad(format!("failed to build OpenAI HTTP client: {error}"))
            })?;

        Ok(Self {
            client,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            api_key,
            base_url,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn payload(
        &self,
        messages: &[Message],
        generation: &GenerationConfig,
        stream: bool,
    ) -> Result<Value, BackendError> {
        let mut payload = Map::new();
        payload.insert("model".to_owned(), json!(self.model));
        payload.insert(
            "messages".to_owned(),
            json!(messages
                .iter()
                .map(|message| json!({"role": message.role.as_str(), "content": message.content}))
                .collect::<Vec<_>>()),
        );
        payload.insert("stream".to_owned(), json!(stream));

        for (key, value) in generation.iter() {
            match key {
                key if FLOAT_PARAMETERS.contains(&key) => {
                    payload.insert(key.to_owned(), json!(generation.f64(key)?));
                }
                "max_tokens" | "max_new_tokens" => {
                    payload.insert("max_tokens".to_owned(), json!(generation.u64(key)?));
                }
                "seed" => {
                    payload.insert("seed".to_owned(), json!(generation.u64(key)?));
                }
                _ => debug!(engine = ENGINE, parameter = key, value = %value, "ignoring parameter"),
            }
        }

        Ok(Value::Object(payload))
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|error| BackendError::Generation(format!("request failed: {error}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown backend error".to_owned());
            return Err(map_http_error(status, body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(
        &self,
        messages: &[Message],
        generation: &GenerationConfig,
    ) -> Result<String, BackendError> {
        let payload = self.payload(messages, generation, false)?;
        let response = self.post(&payload).await?;

        let parsed: OpenAiChatResponse = response
            .json()
            .await
            .map_err(|error| BackendError::Generation(format!("invalid response: {error}")))?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            BackendError::Generation("missing choices in response".to_owned())
        })?;
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        generation: &GenerationConfig,
    ) -> Result<ResponseStream, BackendError> {
        let payload = self.payload(messages, generation, true)?;
        let response = self.post(&payload).await?;

        let mut upstream = response.bytes_stream();
        // Raw bytes: a network chunk may end inside a multi-byte character.
        let mut buffer: Vec<u8> = Vec::new();

        let stream = async_stream::stream! {
            'read: while let Some(next) = upstream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        yield Err(BackendError::Generation(format!("stream read failed: {error}")));
                        break;
                    }
                };

                buffer.extend_from_slice(&bytes);

                while let Some(raw) = next_line(&mut buffer) {
                    let line = match String::from_utf8(raw) {
                        Ok(line) => line,
                        Err(error) => {
                            yield Err(BackendError::Generation(format!("invalid UTF-8 in stream: {error}")));
                            break 'read;
                        }
                    };

                    let Some(payload) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();

                    if payload == "[DONE]" {
                        break 'read;
                    }

                    let parsed: OpenAiStreamResponse = match serde_json::from_str(payload) {
                        Ok(parsed) => parsed,
                        Err(error) => {
                            yield Err(BackendError::Generation(format!("invalid stream event: {error}")));
                            break 'read;
                        }
                    };

                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                        .filter(|value| !value.is_empty());
                    if let Some(content) = content {
                        yield Ok(content);
                    }
                }
            }
        };

        debug!(engine = ENGINE, model = %self.model, "stream prepared");
        Ok(ResponseStream::new(stream))
    }
}

fn config_string(config: &ModelConfig, key: &str) -> Result<Option<String>, BackendError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(value) => Err(BackendError::ModelLoad(format!(
            "{key} must be a string, got {value}"
        ))),
    }
}

/// Removes and returns the first complete line (without its `\n`), if any.
fn next_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let index = buffer.iter().position(|byte| *byte == b'\n')?;
    let mut line = buffer.drain(..=index).collect::<Vec<_>>();
    line.pop();
    Some(line)
}

fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Generation(format!("rate limited: {trimmed}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Generation(format!("upstream timeout: {trimmed}"))
        }
        _ => BackendError::Generation(format!("status {}: {trimmed}", status.as_u16())),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}
