//! llama.cpp runtime for the local backend.
//!
//! Loads GGUF weights through `llama-cpp-2`. The model is shared between
//! requests; every generation builds its own context, so concurrent calls do
//! not step on each other's KV cache.

use std::{
    num::NonZeroU32,
    path::Path,
    sync::{Mutex, OnceLock, PoisonError},
};

use llama_cpp_2::{
    context::params::LlamaContextParams,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaChatMessage, LlamaModel, Special},
    sampling::LlamaSampler,
    token::LlamaToken,
};
use tracing::{debug, info};

use crate::backend::{
    local::{CausalLm, SamplingParams, TokenSink},
    BackendError,
};
use crate::models::{Message, ModelConfig};

static BACKEND: OnceLock<LlamaBackend> = OnceLock::new();
static BACKEND_INIT: Mutex<()> = Mutex::new(());

/// llama.cpp may only be initialised once per process; concurrent first
/// loads queue on `BACKEND_INIT` and reuse the winner's backend.
fn backend() -> Result<&'static LlamaBackend, BackendError> {
    if let Some(backend) = BACKEND.get() {
        return Ok(backend);
    }
    let _init = BACKEND_INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(backend) = BACKEND.get() {
        return Ok(backend);
    }
    let backend = LlamaBackend::init()
        .map_err(|error| BackendError::ModelLoad(format!("failed to initialise llama.cpp: {error}")))?;
    Ok(BACKEND.get_or_init(|| backend))
}

pub struct LlamaRuntime {
    model: LlamaModel,
    device: &'static str,
}

impl LlamaRuntime {
    /// Loads the GGUF file at `path`. `n_gpu_layers` in the config controls
    /// offloading (0 keeps everything on the CPU).
    pub fn load(path: &str, config: &ModelConfig) -> Result<Self, BackendError> {
        if !Path::new(path).is_file() {
            return Err(BackendError::ModelLoad(format!("model file not found: {path}")));
        }
        let gpu_layers = match config.get("n_gpu_layers") {
            None => 0,
            Some(value) => value
                .as_u64()
                .and_then(|layers| u32::try_from(layers).ok())
                .ok_or_else(|| {
                    BackendError::ModelLoad(format!("n_gpu_layers must be an unsigned integer, got {value}"))
                })?,
        };

        let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = LlamaModel::load_from_file(backend()?, path, &params)
            .map_err(|error| BackendError::ModelLoad(format!("{path}: {error}")))?;

        info!(
            path,
            gpu_layers,
            vocab = model.n_vocab(),
            context = model.n_ctx_train(),
            "llama model loaded"
        );

        Ok(Self {
            model,
            device: if gpu_layers > 0 { "gpu" } else { "cpu" },
        })
    }

    fn token_text(&self, token: LlamaToken, special: Special) -> Result<Vec<u8>, BackendError> {
        self.model
            .token_to_bytes(token, special)
            .map_err(|error| BackendError::Generation(format!("detokenize failed: {error}")))
    }
}

impl CausalLm for LlamaRuntime {
    fn device(&self) -> &str {
        self.device
    }

    fn model_max_length(&self) -> usize {
        self.model.n_ctx_train() as usize
    }

    fn apply_chat_template(&self, messages: &[Message]) -> Result<String, BackendError> {
        let template = self
            .model
            .chat_template(None)
            .map_err(|error| BackendError::Generation(format!("no chat template: {error}")))?;
        let chat = messages
            .iter()
            .map(|message| {
                LlamaChatMessage::new(message.role.as_str().to_owned(), message.content.clone())
                    .map_err(|error| BackendError::Generation(format!("bad chat message: {error}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.model
            .apply_chat_template(&template, &chat, true)
            .map_err(|error| BackendError::Generation(format!("chat template failed: {error}")))
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, BackendError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|error| BackendError::Generation(format!("tokenize failed: {error}")))?;
        Ok(tokens.into_iter().map(|token| token.0 as u32).collect())
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String, BackendError> {
        let special = if skip_special_tokens {
            Special::Plaintext
        } else {
            Special::Tokenize
        };
        let mut bytes = Vec::new();
        for id in tokens {
            bytes.extend(self.token_text(LlamaToken::new(*id as i32), special)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn generate(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        sink: &mut dyn TokenSink,
    ) -> Result<Vec<u32>, BackendError> {
        if input_ids.is_empty() {
            return Err(BackendError::Generation("empty prompt".to_owned()));
        }
        let mut output = input_ids.to_vec();
        if sink.put(input_ids).is_break() {
            return Ok(output);
        }

        let budget = params.token_budget(input_ids.len());
        if budget == 0 {
            return Ok(output);
        }

        let n_ctx = (input_ids.len() + budget).min(self.model_max_length()).max(1) as u32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(n_ctx);
        let mut ctx = self
            .model
            .new_context(backend()?, ctx_params)
            .map_err(|error| BackendError::Generation(format!("context creation failed: {error}")))?;

        let mut batch = LlamaBatch::new(input_ids.len(), 1);
        let last = input_ids.len() - 1;
        for (position, id) in input_ids.iter().enumerate() {
            batch
                .add(LlamaToken::new(*id as i32), position as i32, &[0], position == last)
                .map_err(|error| BackendError::Generation(format!("batch add failed: {error}")))?;
        }
        ctx.decode(&mut batch)
            .map_err(|error| BackendError::Generation(format!("prompt decode failed: {error}")))?;

        let mut sampler = if !params.do_sample || params.temperature < 0.01 {
            LlamaSampler::greedy()
        } else {
            let seed = params
                .seed
                .map(|seed| seed as u32)
                .unwrap_or_else(rand::random);
            LlamaSampler::chain_simple([
                LlamaSampler::top_k(params.top_k as i32),
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::temp(params.temperature),
                LlamaSampler::dist(seed),
            ])
        };

        let mut position = input_ids.len() as i32;
        for _ in 0..budget {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            output.push(token.0 as u32);

            if sink.put(&[token.0 as u32]).is_break() {
                debug!("generation interrupted by sink");
                break;
            }
            if self.model.is_eog_token(token) {
                break;
            }

            batch.clear();
            batch
                .add(token, position, &[0], true)
                .map_err(|error| BackendError::Generation(format!("batch add failed: {error}")))?;
            ctx.decode(&mut batch)
                .map_err(|error| BackendError::Generation(format!("decode failed: {error}")))?;
            position += 1;
        }

        Ok(output)
    }
}
