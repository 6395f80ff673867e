use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokio::time::sleep;
use tracing::debug;

use crate::backend::{BackendError, CancelHandle, ChatModel, ResponseStream};
use crate::models::{GenerationConfig, Message, ModelConfig};

pub const ENGINE: &str = "fake";
pub const DEFAULT_MODEL: &str = "fake_chat_model";
pub const SUFFIX: &str = " (generated by fake llm)";

pub const CANDIDATES: [&str; 10] = [
    "That's a great question. Let me think about it for a moment.",
    "I appreciate your perspective, and I'll take that into consideration.",
    "It's an interesting topic, I'd love to discuss it further.",
    "I'm not entirely sure, but I can look into it and get back to you.",
    "I'm open to exploring different ideas and finding a solution together.",
    "I see where you're coming from, and I respect your point of view.",
    "Let's brainstorm some potential options and see what might work best.",
    "I'm willing to collaborate and find a way to move forward.",
    "I value your input, and I'm interested in hearing more about your thoughts.",
    "It's important to approach this with an open mind and consider all possibilities.",
];

const DEFAULT_TOKEN_DELAY: Duration = Duration::from_millis(100);

/// Canned-reply backend for exercising the pipeline without inference.
///
/// Replies ignore the conversation. Set `seed` in the model config to make the
/// sequence of picks reproducible.
#[derive(Debug)]
pub struct FakeChatModel {
    model: String,
    rng: Mutex<StdRng>,
    token_delay: Duration,
}

impl FakeChatModel {
    pub fn new(model: Option<String>, config: ModelConfig) -> Result<Self, BackendError> {
        let rng = match config.get("seed") {
            None => StdRng::from_entropy(),
            Some(value) => {
                let seed = value.as_u64().ok_or_else(|| {
                    BackendError::ModelLoad(format!("seed must be an unsigned integer, got {value}"))
                })?;
                StdRng::seed_from_u64(seed)
            }
        };
        let token_delay = match config.get("token_delay_ms") {
            None => DEFAULT_TOKEN_DELAY,
            Some(value) => value.as_u64().map(Duration::from_millis).ok_or_else(|| {
                BackendError::ModelLoad(format!(
                    "token_delay_ms must be an unsigned integer, got {value}"
                ))
            })?,
        };

        Ok(Self {
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            rng: Mutex::new(rng),
            token_delay,
        })
    }

    fn render_response(&self) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let candidate = CANDIDATES.choose(&mut *rng).copied().unwrap_or(CANDIDATES[0]);
        format!("{candidate}{SUFFIX}")
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(
        &self,
        _messages: &[Message],
        _generation: &GenerationConfig,
    ) -> Result<String, BackendError> {
        Ok(self.render_response())
    }

    async fn invoke_stream(
        &self,
        _messages: &[Message],
        _generation: &GenerationConfig,
    ) -> Result<ResponseStream, BackendError> {
        let content = self.render_response();
        let delay = self.token_delay;
        let cancel = CancelHandle::new();
        let stop = cancel.clone();

        let stream = async_stream::stream! {
            for (index, part) in content.split_whitespace().enumerate() {
                if index > 0 {
                    sleep(delay).await;
                }
                if stop.is_cancelled() {
                    break;
                }
                yield Ok::<String, BackendError>(format!("{part} "));
            }
        };

        debug!(engine = ENGINE, model = %self.model, "stream prepared");
        Ok(ResponseStream::with_cancel(stream, cancel))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;

    fn config(value: serde_json::Value) -> ModelConfig {
        value.as_object().cloned().unwrap_or_default()
    }

    fn quick_model(seed: Option<u64>) -> FakeChatModel {
        let mut options = config(json!({"token_delay_ms": 0}));
        if let Some(seed) = seed {
            options.insert("seed".to_owned(), json!(seed));
        }
        FakeChatModel::new(None, options).expect("fake model")
    }

    #[test]
    fn defaults_model_name() {
        let model = FakeChatModel::new(None, ModelConfig::new()).expect("fake model");
        assert_eq!(model.engine(), "fake");
        assert_eq!(model.model(), "fake_chat_model");

        let named = FakeChatModel::new(Some("demo".to_owned()), ModelConfig::new()).unwrap();
        assert_eq!(named.model(), "demo");
    }

    #[test]
    fn rejects_malformed_seed() {
        let error = FakeChatModel::new(None, config(json!({"seed": "abc"})))
            .expect_err("string seed should fail");
        assert!(matches!(error, BackendError::ModelLoad(_)));
    }

    #[tokio::test]
    async fn invoke_returns_a_candidate_with_suffix() {
        let model = quick_model(None);
        let messages = [Message::user("hi")];

        for _ in 0..20 {
            let reply = model
                .invoke(&messages, &GenerationConfig::default())
                .await
                .expect("fake invoke");
            let candidate = reply
                .strip_suffix(" (generated by fake llm)")
                .expect("reply should carry the synthetic suffix");
            assert!(CANDIDATES.contains(&candidate), "unexpected reply: {reply}");
        }
    }

    #[tokio::test]
    async fn seeded_models_repeat_the_same_replies() {
        let first = quick_model(Some(7));
        let second = quick_model(Some(7));
        let messages = [Message::user("hi")];
        let generation = GenerationConfig::default();

        for _ in 0..5 {
            assert_eq!(
                first.invoke(&messages, &generation).await.unwrap(),
                second.invoke(&messages, &generation).await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn stream_yields_one_fragment_per_word() {
        let model = quick_model(None);
        let fragments: Vec<String> = model
            .invoke_stream(&[Message::user("hi")], &GenerationConfig::default())
            .await
            .expect("fake stream")
            .map(|fragment| fragment.expect("fragment"))
            .collect()
            .await;

        assert!(fragments.iter().all(|fragment| fragment.ends_with(' ')));
        let joined = fragments.concat();
        let reply = joined.trim_end();
        let candidate = reply
            .strip_suffix(" (generated by fake llm)")
            .expect("suffix streamed");
        assert!(CANDIDATES.contains(&candidate));
        assert_eq!(fragments.len(), reply.split_whitespace().count());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_waits_between_fragments() {
        let model = FakeChatModel::new(None, ModelConfig::new()).expect("fake model");
        let started = tokio::time::Instant::now();

        let count = model
            .invoke_stream(&[Message::user("hi")], &GenerationConfig::default())
            .await
            .expect("fake stream")
            .count()
            .await;

        let expected = DEFAULT_TOKEN_DELAY * (count as u32 - 1);
        assert!(started.elapsed() >= expected);
    }

    #[tokio::test]
    async fn cancelled_stream_stops_early() {
        let model = quick_model(None);
        let mut stream = model
            .invoke_stream(&[Message::user("hi")], &GenerationConfig::default())
            .await
            .expect("fake stream");

        assert!(stream.next().await.is_some());
        stream.cancel();
        assert!(stream.next().await.is_none());
    }
}
