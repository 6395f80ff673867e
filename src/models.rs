use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::BackendError;

/// Free-form options handed to a backend at construction time.
pub type ModelConfig = Map<String, Value>;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Sampling parameters keyed by name (`temperature`, `top_p`, `max_new_tokens`, ...).
///
/// A `null` value means the parameter is unset and the backend default applies.
/// Backends read the keys they understand through the typed accessors, which
/// reject values of the wrong type, and leave the rest alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct GenerationConfig(Map<String, Value>);

impl GenerationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value for `key`, treating `null` as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Iterates over the set (non-null) entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn f64(&self, key: &str) -> Result<Option<f64>, BackendError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| invalid_parameter(key, "a number", value)),
        }
    }

    pub fn f32(&self, key: &str) -> Result<Option<f32>, BackendError> {
        Ok(self.f64(key)?.map(|value| value as f32))
    }

    /// Reads a non-negative integer. Whole floats such as `512.0` are accepted
    /// since sliders report every value as a float.
    pub fn u64(&self, key: &str) -> Result<Option<u64>, BackendError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        if let Some(integer) = value.as_u64() {
            return Ok(Some(integer));
        }
        match value.as_f64() {
            Some(float) if float >= 0.0 && float.fract() == 0.0 && float <= u64::MAX as f64 => {
                Ok(Some(float as u64))
            }
            _ => Err(invalid_parameter(key, "a non-negative integer", value)),
        }
    }

    pub fn u32(&self, key: &str) -> Result<Option<u32>, BackendError> {
        match self.u64(key)? {
            None => Ok(None),
            Some(value) => u32::try_from(value).map(Some).map_err(|_| {
                BackendError::Generation(format!("parameter `{key}` is out of range: {value}"))
            }),
        }
    }

    /// Reads a flag. Numbers are accepted as well, non-zero meaning `true`.
    pub fn bool(&self, key: &str) -> Result<Option<bool>, BackendError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(flag)) => Ok(Some(*flag)),
            Some(value) => value
                .as_f64()
                .map(|number| Some(number != 0.0))
                .ok_or_else(|| invalid_parameter(key, "a boolean", value)),
        }
    }

    /// Returns `defaults` overridden by every set entry of `self`.
    pub fn layered_on(&self, defaults: GenerationConfig) -> GenerationConfig {
        let mut merged = defaults;
        for (key, value) in self.iter() {
            merged.insert(key, value.clone());
        }
        merged
    }
}

impl From<Map<String, Value>> for GenerationConfig {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

fn invalid_parameter(key: &str, expected: &str, value: &Value) -> BackendError {
    BackendError::Generation(format!(
        "parameter `{key}` must be {expected}, got {value}"
    ))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionsRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(flatten)]
    pub generation: GenerationConfig,
}

impl ChatCompletionsRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("messages must not be empty".to_owned());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionsResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatCompletionsResponse {
    pub fn new(id: String, created: i64, model: String, content: String) -> Self {
        Self {
            id,
            object: "chat.completion".to_owned(),
            created,
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop".to_owned(),
            }],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionsChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: DeltaMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeltaMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionsChunk {
    fn with_choice(id: &str, created: i64, model: &str, choice: ChunkChoice) -> Self {
        Self {
            id: id.to_owned(),
            object: "chat.completion.chunk".to_owned(),
            created,
            model: model.to_owned(),
            choices: vec![choice],
        }
    }

    pub fn role(id: &str, created: i64, model: &str) -> Self {
        Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: DeltaMessage {
                    role: Some("assistant"),
                    content: None,
                },
                finish_reason: None,
            },
        )
    }

    pub fn delta(id: &str, created: i64, model: &str, content: String) -> Self {
        Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: DeltaMessage {
                    role: None,
                    content: Some(content),
                },
                finish_reason: None,
            },
        )
    }

    pub fn finish(id: &str, created: i64, model: &str) -> Self {
        Self::with_choice(
            id,
            created,
            model,
            ChunkChoice {
                index: 0,
                delta: DeltaMessage {
                    role: None,
                    content: None,
                },
                finish_reason: Some("stop".to_owned()),
            },
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
}
