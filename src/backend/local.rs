//! Locally hosted causal language model backend.
//!
//! The model itself sits behind [`CausalLm`] so the prompt preparation,
//! echo stripping and streaming logic here stay independent of the inference
//! runtime. Streaming runs generation on a dedicated worker thread that feeds a
//! bounded channel through a [`TokenSink`]; the consumer drains the channel as
//! a [`ResponseStream`].

use std::{ops::ControlFlow, sync::Arc, thread};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, CancelHandle, ChatModel, ResponseStream};
use crate::models::{GenerationConfig, Message, ModelConfig};

pub const ENGINE: &str = "local";
pub const DEFAULT_MODEL: &str = "models/qwen1_5-4b-chat-q4_k_m.gguf";

const STREAM_BUFFER: usize = 32;
const KNOWN_PARAMETERS: [&str; 8] = [
    "do_sample",
    "temperature",
    "top_k",
    "top_p",
    "repetition_penalty",
    "max_length",
    "max_new_tokens",
    "seed",
];

/// Receives token ids while a sequence is generated.
///
/// Runtimes call `put` once with the prompt ids, then once per new token.
/// Returning `Break` asks the runtime to stop after the current step.
pub trait TokenSink {
    fn put(&mut self, tokens: &[u32]) -> ControlFlow<()>;
}

/// Sink for blocking generation where nothing is observed mid-flight.
pub struct DiscardSink;

impl TokenSink for DiscardSink {
    fn put(&mut self, _tokens: &[u32]) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// A loaded model together with its tokenizer.
pub trait CausalLm: Send + Sync + 'static {
    /// Where the weights live, for logging (`cpu`, `gpu`, ...).
    fn device(&self) -> &str;

    /// Longest sequence (prompt plus completion) the tokenizer is configured for.
    fn model_max_length(&self) -> usize;

    /// Renders the conversation with the model's chat template, ending with
    /// the assistant generation prompt.
    fn apply_chat_template(&self, messages: &[Message]) -> Result<String, BackendError>;

    fn encode(&self, text: &str) -> Result<Vec<u32>, BackendError>;

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String, BackendError>;

    /// Generates a continuation of a single sequence. The returned ids start
    /// with `input_ids`.
    fn generate(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        sink: &mut dyn TokenSink,
    ) -> Result<Vec<u32>, BackendError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub do_sample: bool,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub max_length: usize,
    pub max_new_tokens: Option<usize>,
    pub seed: Option<u64>,
    /// Entries this backend does not interpret, left for the runtime.
    pub extra: GenerationConfig,
}

impl SamplingParams {
    /// Layers the caller's parameters over the backend defaults (sampling on,
    /// length capped at the tokenizer limit).
    pub fn resolve(
        generation: &GenerationConfig,
        model_max_length: usize,
    ) -> Result<Self, BackendError> {
        let defaults = GenerationConfig::new()
            .with("do_sample", true)
            .with("max_length", model_max_length as u64);
        let merged = generation.layered_on(defaults);

        let mut extra = GenerationConfig::new();
        for (key, value) in merged.iter() {
            if !KNOWN_PARAMETERS.contains(&key) {
                extra.insert(key, value.clone());
            }
        }

        Ok(Self {
            do_sample: merged.bool("do_sample")?.unwrap_or(true),
            temperature: merged.f32("temperature")?.unwrap_or(1.0),
            top_k: merged.u32("top_k")?.unwrap_or(50),
            top_p: merged.f32("top_p")?.unwrap_or(1.0),
            repetition_penalty: merged.f32("repetition_penalty")?.unwrap_or(1.0),
            max_length: merged
                .u64("max_length")?
                .map_or(model_max_length, |value| value as usize),
            max_new_tokens: merged.u64("max_new_tokens")?.map(|value| value as usize),
            seed: merged.u64("seed")?,
            extra,
        })
    }

    /// How many tokens may follow a prompt of `prompt_len` ids.
    pub fn token_budget(&self, prompt_len: usize) -> usize {
        let by_length = self.max_length.saturating_sub(prompt_len);
        self.max_new_tokens
            .map_or(by_length, |limit| limit.min(by_length))
    }
}

pub struct LocalTransformerModel<R> {
    model: String,
    config: ModelConfig,
    runtime: Arc<R>,
}

impl<R: CausalLm> LocalTransformerModel<R> {
    /// Resolves the model name, forces `trust_remote_code` on and hands both
    /// to `loader`.
    pub fn load_with<F>(
        model: Option<String>,
        config: ModelConfig,
        loader: F,
    ) -> Result<Self, BackendError>
    where
        F: FnOnce(&str, &ModelConfig) -> Result<R, BackendError>,
    {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_owned());
        let mut config = config;
        config.insert("trust_remote_code".to_owned(), Value::Bool(true));

        let runtime = loader(&model, &config)?;
        info!(
            engine = ENGINE,
            model = %model,
            device = runtime.device(),
            max_length = runtime.model_max_length(),
            "local model loaded"
        );

        Ok(Self {
            model,
            config,
            runtime: Arc::new(runtime),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    fn prepare_inputs(&self, messages: &[Message]) -> Result<Vec<u32>, BackendError> {
        let prompt = self.runtime.apply_chat_template(messages)?;
        let input_ids = self.runtime.encode(&prompt)?;
        if input_ids.is_empty() {
            return Err(BackendError::Generation(
                "prompt encoded to zero tokens".to_owned(),
            ));
        }

        debug!(
            model = %self.model,
            device = self.runtime.device(),
            prompt_tokens = input_ids.len(),
            "inputs prepared"
        );
        Ok(input_ids)
    }
}

#[async_trait]
impl<R: CausalLm> ChatModel for LocalTransformerModel<R> {
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
        let input_ids = self.prepare_inputs(messages)?;
        let params = SamplingParams::resolve(generation, self.runtime.model_max_length())?;
        let runtime = self.runtime.clone();

        tokio::task::spawn_blocking(move || generate_reply(runtime.as_ref(), &input_ids, &params))
            .await
            .map_err(|error| BackendError::Generation(format!("generation task failed: {error}")))?
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        generation: &GenerationConfig,
    ) -> Result<ResponseStream, BackendError> {
        let input_ids = self.prepare_inputs(messages)?;
        let params = SamplingParams::resolve(generation, self.runtime.model_max_length())?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = CancelHandle::new();
        let mut streamer = TextStreamer::new(self.runtime.clone(), tx, cancel.clone());
        let runtime = self.runtime.clone();
        let model = self.model.clone();

        thread::Builder::new()
            .name("local-generate".to_owned())
            .spawn(move || {
                let outcome = runtime
                    .generate(&input_ids, &params, &mut streamer)
                    .and_then(|_| streamer.finish());
                match outcome {
                    Ok(()) if streamer.is_cancelled() => {
                        debug!(model = %model, "generation stopped by consumer")
                    }
                    Ok(()) => debug!(model = %model, "generation finished"),
                    Err(error) => {
                        warn!(model = %model, error = %error, "generation failed mid-stream");
                        streamer.fail(error);
                    }
                }
            })
            .map_err(|error| {
                BackendError::Generation(format!("failed to spawn generation worker: {error}"))
            })?;

        debug!(engine = ENGINE, model = %self.model, "stream prepared");
        Ok(ResponseStream::with_cancel(ReceiverStream::new(rx), cancel))
    }
}

fn generate_reply<R: CausalLm>(
    runtime: &R,
    input_ids: &[u32],
    params: &SamplingParams,
) -> Result<String, BackendError> {
    let output = runtime.generate(input_ids, params, &mut DiscardSink)?;
    let generated = output.get(input_ids.len()..).unwrap_or_default();
    runtime.decode(generated, true)
}

/// Turns generated ids into text fragments on the worker thread.
///
/// Ids are decoded cumulatively and text is released up to the last space, so
/// fragments never split a word or a multi-byte character.
struct TextStreamer<R> {
    runtime: Arc<R>,
    sender: mpsc::Sender<Result<String, BackendError>>,
    cancel: CancelHandle,
    skip_prompt: bool,
    token_cache: Vec<u32>,
    print_len: usize,
    error: Option<BackendError>,
}

impl<R: CausalLm> TextStreamer<R> {
    fn new(
        runtime: Arc<R>,
        sender: mpsc::Sender<Result<String, BackendError>>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            runtime,
            sender,
            cancel,
            skip_prompt: true,
            token_cache: Vec::new(),
            print_len: 0,
            error: None,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }

    fn emit(&mut self, text: String) -> ControlFlow<()> {
        if text.is_empty() {
            return ControlFlow::Continue(());
        }
        match self.sender.blocking_send(Ok(text)) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }

    fn decoded(&mut self) -> Option<String> {
        match self.runtime.decode(&self.token_cache, true) {
            Ok(text) => Some(text),
            Err(error) => {
                self.error = Some(error);
                None
            }
        }
    }

    /// Flushes whatever text is still held back.
    fn finish(&mut self) -> Result<(), BackendError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if self.is_cancelled() || self.token_cache.is_empty() {
            return Ok(());
        }
        let Some(text) = self.decoded() else {
            return Err(self.error.take().unwrap_or_else(|| {
                BackendError::Generation("decode failed".to_owned())
            }));
        };
        let rest = text.get(self.print_len..).unwrap_or_default().to_owned();
        self.token_cache.clear();
        self.print_len = 0;
        let _ = self.emit(rest);
        Ok(())
    }

    fn fail(&mut self, error: BackendError) {
        let _ = self.sender.blocking_send(Err(error));
    }
}

impl<R: CausalLm> TokenSink for TextStreamer<R> {
    fn put(&mut self, tokens: &[u32]) -> ControlFlow<()> {
        if self.is_cancelled() {
            return ControlFlow::Break(());
        }
        if self.skip_prompt {
            self.skip_prompt = false;
            return ControlFlow::Continue(());
        }

        self.token_cache.extend_from_slice(tokens);
        let Some(text) = self.decoded() else {
            return ControlFlow::Break(());
        };

        let printable = if text.ends_with('\n') {
            let rest = text.get(self.print_len..).unwrap_or_default().to_owned();
            self.token_cache.clear();
            self.print_len = 0;
            rest
        } else if text.ends_with('\u{FFFD}') {
            String::new()
        } else if text.chars().next_back().is_some_and(is_cjk_char) {
            // Ideographic scripts carry no spaces, so release every character.
            let rest = text.get(self.print_len..).unwrap_or_default().to_owned();
            self.print_len = text.len();
            rest
        } else {
            match text.rfind(' ') {
                Some(index) if index + 1 > self.print_len => {
                    let chunk = text
                        .get(self.print_len..index + 1)
                        .unwrap_or_default()
                        .to_owned();
                    self.print_len = index + 1;
                    chunk
                }
                _ => String::new(),
            }
        };

        self.emit(printable)
    }
}

/// CJK unified ideograph blocks, including the extensions and compatibility forms.
fn is_cjk_char(c: char) -> bool {
    matches!(
        u32::from(c),
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2A6DF
            | 0x2A700..=0x2B73F
            | 0x2B740..=0x2B81F
            | 0x2B820..=0x2CEAF
            | 0xF900..=0xFAFF
            | 0x2F800..=0x2FA1F
    )
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::{Duration, Instant},
    };

    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;

    const VOCAB: [&str; 13] = [
        "<eos>",
        "<|im_start|>",
        "<|im_end|>",
        "<unk>",
        "user",
        "assistant",
        "hi",
        "Hello",
        "there",
        "how",
        "are",
        "you",
        "system",
    ];
    const SPECIAL: u32 = 2;
    const EOS: u32 = 0;

    const BYTE_OFFSET: u32 = SPECIAL + 1;

    #[derive(Clone, Copy)]
    enum Vocab {
        /// One id per whitespace-separated word, decoded space-joined.
        Words,
        /// One id per UTF-8 byte, so characters can straddle tokens.
        Bytes,
    }

    /// Stand-in runtime that replays a fixed reply.
    struct ScriptedLm {
        vocab: Vocab,
        reply: Vec<u32>,
        step_delay: Duration,
        fail_at: Option<usize>,
        steps: AtomicUsize,
        partial_decodes: AtomicUsize,
        last_params: Mutex<Option<SamplingParams>>,
    }

    impl ScriptedLm {
        fn new(reply: &str) -> Self {
            Self::with_vocab(Vocab::Words, reply)
        }

        fn bytes(reply: &str) -> Self {
            Self::with_vocab(Vocab::Bytes, reply)
        }

        fn with_vocab(vocab: Vocab, reply: &str) -> Self {
            let mut ids = encode_with(vocab, reply);
            ids.push(EOS);
            Self {
                vocab,
                reply: ids,
                step_delay: Duration::ZERO,
                fail_at: None,
                steps: AtomicUsize::new(0),
                partial_decodes: AtomicUsize::new(0),
                last_params: Mutex::new(None),
            }
        }
    }

    fn encode_with(vocab: Vocab, text: &str) -> Vec<u32> {
        match vocab {
            Vocab::Words => text
                .split_whitespace()
                .map(|word| VOCAB.iter().position(|entry| *entry == word).unwrap_or(3) as u32)
                .collect(),
            Vocab::Bytes => text.bytes().map(|byte| u32::from(byte) + BYTE_OFFSET).collect(),
        }
    }

    impl CausalLm for ScriptedLm {
        fn device(&self) -> &str {
            "cpu"
        }

        fn model_max_length(&self) -> usize {
            256
        }

        fn apply_chat_template(&self, messages: &[Message]) -> Result<String, BackendError> {
            let mut prompt = messages
                .iter()
                .map(|message| {
                    format!("<|im_start|> {} {} <|im_end|>", message.role.as_str(), message.content)
                })
                .collect::<Vec<_>>()
                .join(" ");
            prompt.push_str(" <|im_start|> assistant");
            Ok(prompt)
        }

        fn encode(&self, text: &str) -> Result<Vec<u32>, BackendError> {
            Ok(encode_with(self.vocab, text))
        }

        fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String, BackendError> {
            let kept = tokens
                .iter()
                .copied()
                .filter(|id| !skip_special_tokens || *id > SPECIAL);
            let text = match self.vocab {
                Vocab::Words => kept
                    .map(|id| VOCAB[id as usize])
                    .collect::<Vec<_>>()
                    .join(" "),
                Vocab::Bytes => {
                    let mut bytes = Vec::new();
                    for id in kept {
                        if id >= BYTE_OFFSET {
                            bytes.push((id - BYTE_OFFSET) as u8);
                        } else {
                            bytes.extend_from_slice(VOCAB[id as usize].as_bytes());
                        }
                    }
                    String::from_utf8_lossy(&bytes).into_owned()
                }
            };
            if text.contains('\u{FFFD}') {
                self.partial_decodes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(text)
        }

        fn generate(
            &self,
            input_ids: &[u32],
            params: &SamplingParams,
            sink: &mut dyn TokenSink,
        ) -> Result<Vec<u32>, BackendError> {
            *self.last_params.lock().unwrap() = Some(params.clone());
            let mut output = input_ids.to_vec();
            if sink.put(input_ids).is_break() {
                return Ok(output);
            }

            let budget = params.token_budget(input_ids.len());
            for (step, token) in self.reply.iter().copied().take(budget).enumerate() {
                std::thread::sleep(self.step_delay);
                self.steps.fetch_add(1, Ordering::SeqCst);
                if self.fail_at == Some(step) {
                    return Err(BackendError::Generation("device lost".to_owned()));
                }
                output.push(token);
                if sink.put(&[token]).is_break() || token == EOS {
                    break;
                }
            }
            Ok(output)
        }
    }

    fn local_model(runtime: ScriptedLm) -> LocalTransformerModel<ScriptedLm> {
        LocalTransformerModel::load_with(None, ModelConfig::new(), |_, _| Ok(runtime))
            .expect("scripted runtime loads")
    }

    fn conversation() -> Vec<Message> {
        vec![Message::user("hi")]
    }

    #[test]
    fn load_forces_trust_flag_and_default_model() {
        let mut seen = None;
        let model = LocalTransformerModel::load_with(None, ModelConfig::new(), |name, config| {
            seen = Some((name.to_owned(), config.clone()));
            Ok(ScriptedLm::new("Hello"))
        })
        .expect("scripted runtime loads");

        let (name, config) = seen.expect("loader called");
        assert_eq!(name, DEFAULT_MODEL);
        assert_eq!(config.get("trust_remote_code"), Some(&json!(true)));
        assert_eq!(model.engine(), "local");
        assert_eq!(model.model(), DEFAULT_MODEL);
        assert_eq!(model.config().get("trust_remote_code"), Some(&json!(true)));
    }

    #[test]
    fn loader_failure_surfaces_as_model_load() {
        let result = LocalTransformerModel::<ScriptedLm>::load_with(
            Some("missing.gguf".to_owned()),
            ModelConfig::new(),
            |name, _| Err(BackendError::ModelLoad(format!("{name} not found"))),
        );

        assert!(matches!(result, Err(BackendError::ModelLoad(message)) if message.contains("missing.gguf")));
    }

    #[test]
    fn sampling_defaults_can_be_overridden() {
        let defaults = SamplingParams::resolve(&GenerationConfig::new(), 4096).unwrap();
        assert!(defaults.do_sample);
        assert_eq!(defaults.max_length, 4096);
        assert_eq!(defaults.max_new_tokens, None);

        let caller = GenerationConfig::new()
            .with("do_sample", false)
            .with("max_length", 128)
            .with("max_new_tokens", 16.0)
            .with("typical_p", 0.5);
        let params = SamplingParams::resolve(&caller, 4096).unwrap();
        assert!(!params.do_sample);
        assert_eq!(params.max_length, 128);
        assert_eq!(params.token_budget(120), 8);
        assert_eq!(params.token_budget(10), 16);
        assert_eq!(params.extra.f64("typical_p").unwrap(), Some(0.5));
    }

    #[tokio::test]
    async fn invoke_strips_the_echoed_prompt() {
        let model = local_model(ScriptedLm::new("Hello there how are you"));

        let reply = model
            .invoke(&conversation(), &GenerationConfig::default())
            .await
            .expect("local invoke");

        assert_eq!(reply, "Hello there how are you");
        assert!(!reply.contains("<|im_start|>"));
        assert!(!reply.contains("user"));
    }

    #[tokio::test]
    async fn invoke_passes_caller_parameters_to_the_runtime() {
        let model = local_model(ScriptedLm::new("Hello there how are you"));
        let generation = GenerationConfig::new()
            .with("temperature", 0.2)
            .with("max_new_tokens", 3)
            .with("custom_flag", 1);

        let reply = model.invoke(&conversation(), &generation).await.unwrap();

        assert_eq!(reply, "Hello there how");
        let params = model
            .runtime()
            .last_params
            .lock()
            .unwrap()
            .clone()
            .expect("runtime saw parameters");
        assert!(params.do_sample);
        assert_eq!(params.max_length, 256);
        assert!((params.temperature - 0.2).abs() < f32::EPSILON);
        assert!(params.extra.get("custom_flag").is_some());
    }

    #[tokio::test]
    async fn malformed_parameters_fail_before_generation() {
        let model = local_model(ScriptedLm::new("Hello"));
        let generation = GenerationConfig::new().with("temperature", "hot");

        let error = model
            .invoke(&conversation(), &generation)
            .await
            .expect_err("string temperature");

        assert!(matches!(error, BackendError::Generation(_)));
        assert_eq!(model.runtime().steps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_matches_invoke_and_skips_special_tokens() {
        let model = local_model(ScriptedLm::new("Hello there how are you"));

        let fragments: Vec<String> = model
            .invoke_stream(&conversation(), &GenerationConfig::default())
            .await
            .expect("local stream")
            .map(|fragment| fragment.expect("fragment"))
            .collect()
            .await;

        assert_eq!(fragments, vec!["Hello ", "there ", "how ", "are ", "you"]);
        assert!(fragments.iter().all(|fragment| !fragment.contains('<')));
    }

    #[tokio::test]
    async fn stream_delivers_fragments_before_generation_completes() {
        let mut runtime = ScriptedLm::new("Hello there how are you");
        runtime.step_delay = Duration::from_millis(40);
        let model = local_model(runtime);
        let started = Instant::now();

        let mut stream = model
            .invoke_stream(&conversation(), &GenerationConfig::default())
            .await
            .expect("local stream");
        assert!(started.elapsed() < Duration::from_millis(200));

        let mut first_at = None;
        while let Some(fragment) = stream.next().await {
            fragment.expect("fragment");
            first_at.get_or_insert_with(|| started.elapsed());
        }
        let finished_at = started.elapsed();

        let first_at = first_at.expect("at least one fragment");
        assert!(first_at < finished_at);
        assert!(finished_at >= Duration::from_millis(240));
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_worker() {
        let mut runtime = ScriptedLm::new(&["Hello"; 60].join(" "));
        runtime.step_delay = Duration::from_millis(5);
        let model = local_model(runtime);

        let mut stream = model
            .invoke_stream(&conversation(), &GenerationConfig::default())
            .await
            .expect("local stream");
        assert!(stream.next().await.is_some());
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stopped_at = model.runtime().steps.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(model.runtime().steps.load(Ordering::SeqCst), stopped_at);
        assert!(stopped_at < 58);
    }

    #[tokio::test]
    async fn worker_failure_is_delivered_after_partial_output() {
        let mut runtime = ScriptedLm::new("Hello there how are you");
        runtime.fail_at = Some(3);
        let model = local_model(runtime);

        let items: Vec<Result<String, BackendError>> = model
            .invoke_stream(&conversation(), &GenerationConfig::default())
            .await
            .expect("local stream")
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_deref().unwrap(), "Hello ");
        assert_eq!(items[1].as_deref().unwrap(), "there ");
        assert!(matches!(&items[2], Err(BackendError::Generation(message)) if message == "device lost"));
    }

    #[test]
    fn multi_turn_conversation_is_rendered_in_order() {
        let model = local_model(ScriptedLm::new("Hello"));
        let conversation = [
            Message::system("hi"),
            Message::user("hi"),
            Message::assistant("Hello there"),
            Message::user("how are you"),
        ];

        let input_ids = model.prepare_inputs(&conversation).expect("inputs");
        let prompt = model.runtime().decode(&input_ids, false).unwrap();

        assert_eq!(
            prompt,
            "<|im_start|> system hi <|im_end|> <|im_start|> user hi <|im_end|> \
             <|im_start|> assistant Hello there <|im_end|> \
             <|im_start|> user how are you <|im_end|> <|im_start|> assistant"
        );
        assert_eq!(model.runtime().decode(&input_ids, true).unwrap(), "system hi user hi assistant Hello there user how are you assistant");
    }

    #[tokio::test]
    async fn ideographs_are_released_as_they_are_generated() {
        let mut runtime = ScriptedLm::bytes("你好世界");
        runtime.step_delay = Duration::from_millis(10);
        let model = local_model(runtime);
        let started = Instant::now();

        let mut stream = model
            .invoke_stream(&conversation(), &GenerationConfig::default())
            .await
            .expect("local stream");
        let mut seen = Vec::new();
        while let Some(fragment) = stream.next().await {
            seen.push((started.elapsed(), fragment.expect("fragment")));
        }
        let finished_at = started.elapsed();

        let texts = seen.iter().map(|(_, text)| text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["你", "好", "世", "界"]);
        assert!(seen[0].0 + Duration::from_millis(50) < finished_at);
    }

    #[tokio::test]
    async fn partial_characters_are_held_until_complete() {
        let model = local_model(ScriptedLm::bytes("👋 hi"));

        let fragments: Vec<String> = model
            .invoke_stream(&conversation(), &GenerationConfig::default())
            .await
            .expect("local stream")
            .map(|fragment| fragment.expect("fragment"))
            .collect()
            .await;

        assert!(model.runtime().partial_decodes.load(Ordering::SeqCst) > 0);
        assert_eq!(fragments, vec!["👋 ", "hi"]);
        assert!(fragments.iter().all(|fragment| !fragment.contains('\u{FFFD}')));
    }

    #[tokio::test]
    async fn byte_level_invoke_decodes_whole_characters() {
        let model = local_model(ScriptedLm::bytes("你好 👋"));

        let reply = model
            .invoke(&conversation(), &GenerationConfig::default())
            .await
            .expect("local invoke");

        assert_eq!(reply, "你好 👋");
    }
}
