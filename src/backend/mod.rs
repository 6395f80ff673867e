pub mod fake;
#[cfg(feature = "llama")]
pub mod llama;
pub mod local;
pub mod openai;
pub mod registry;
pub mod stream;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{GenerationConfig, Message};

pub use stream::{CancelHandle, ResponseStream};

/// A constructed chat backend bound to one model.
///
/// Every engine exposes the same two entry points: `invoke` resolves once the
/// whole reply is available, `invoke_stream` hands back a [`ResponseStream`]
/// that yields fragments in generation order as they are produced.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn engine(&self) -> &str;
    fn model(&self) -> &str;
    async fn invoke(
        &self,
        messages: &[Message],
        generation: &GenerationConfig,
    ) -> Result<String, BackendError>;
    async fn invoke_stream(
        &self,
        messages: &[Message],
        generation: &GenerationConfig,
    ) -> Result<ResponseStream, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown engine: {0}")]
    UnknownEngine(String),
    #[error("engine already registered: {0}")]
    DuplicateEngine(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("generation failed: {0}")]
    Generation(String),
}
