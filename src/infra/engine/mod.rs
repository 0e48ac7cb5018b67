//! Interface to the native inference engine.
//!
//! The broker owns exactly one `InferenceEngine` at a time. Engines are built
//! through an `EngineFactory` so each instance is bound to the callbacks of
//! the broker generation that created it.

pub mod candle;
pub mod template;

pub use self::candle::{CandleEngine, CandleEngineFactory, SamplingOptions};

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::{ChatMessage, ModelAssetPaths, ModelDescriptor, Result};

pub type ProgressFn = dyn Fn(f32) + Send + Sync;

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn load(&self, paths: &ModelAssetPaths, progress: &ProgressFn) -> Result<()>;

    async fn configure(&self, system_prompt: Option<&str>) -> Result<()>;

    /// Runs one full-transcript generation. The engine keeps no conversation
    /// state between calls. Tokens are streamed through the bound callbacks.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Advisory stop signal. The running `generate` settles on its own,
    /// usually with an [`Interrupted`] error. A signal that arrives before
    /// `generate` starts applies to that next call.
    fn interrupt(&self);

    /// Drops any pending stop signal. The broker calls this when it hands a
    /// new request to the engine, before that request can be interrupted.
    fn clear_interrupt(&self);

    async fn dispose(&self);
}

pub trait EngineFactory: Send + Sync {
    fn create(&self, descriptor: &ModelDescriptor, callbacks: EngineCallbacks) -> Arc<dyn InferenceEngine>;
}

/// Receiver for engine side-channel events.
pub trait EngineEvents: Send + Sync {
    fn on_token(&self, token: &str);
    fn on_history(&self, messages: &[ChatMessage]);
}

/// Cloneable handle engines use to emit token and history events.
#[derive(Clone)]
pub struct EngineCallbacks {
    events: Arc<dyn EngineEvents>,
}

impl EngineCallbacks {
    pub fn new(events: Arc<dyn EngineEvents>) -> Self {
        Self { events }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopEvents))
    }

    pub fn token(&self, token: &str) {
        self.events.on_token(token);
    }

    pub fn history(&self, messages: &[ChatMessage]) {
        self.events.on_history(messages);
    }
}

struct NoopEvents;

impl EngineEvents for NoopEvents {
    fn on_token(&self, _token: &str) {}
    fn on_history(&self, _messages: &[ChatMessage]) {}
}

/// Error an engine returns when `interrupt` stopped a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("generation interrupted")]
pub struct Interrupted;

pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Interrupted>().is_some()
}
