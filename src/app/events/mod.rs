use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::{ConversationId, ModelId};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ModelLoading { model: ModelId, progress: f32 },
    ModelLoaded { model: ModelId },
    ModelLoadFailed { model: ModelId, error: String },
    ModelUnloaded { model: ModelId },
    GenerationQueued { conversation: ConversationId, position: usize },
    GenerationStarted { conversation: ConversationId },
    GenerationCompleted { conversation: ConversationId, tokens: usize },
    GenerationFailed { conversation: ConversationId, error: String },
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
    fn name(&self) -> &str;
}

pub type HandlerId = usize;

pub struct EventBus {
    handlers: RwLock<HashMap<HandlerId, Arc<dyn EventHandler>>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn subscribe<H: EventHandler + 'static>(&self, handler: H) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().insert(id, Arc::new(handler));
        id
    }

    pub fn unsubscribe(&self, handler_id: HandlerId) {
        self.handlers.write().remove(&handler_id);
    }

    pub fn publish(&self, event: Event) {
        // Handlers may subscribe or publish in turn.
        let handlers: Vec<Arc<dyn EventHandler>> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler.handle(&event);
        }
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &Event) {
        match event {
            Event::ModelLoading { model, progress } => {
                tracing::debug!(%model, progress = *progress, "loading model")
            }
            Event::ModelLoadFailed { model, error } => tracing::error!(%model, %error, "model load failed"),
            Event::GenerationFailed { conversation, error } => {
                tracing::warn!(%conversation, %error, "generation failed")
            }
            other => tracing::info!("event: {:?}", other),
        }
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Keeps every event; handy for assertions and for the CLI's status output.
#[derive(Default, Clone)]
pub struct RecordingHandler {
    events: Arc<RwLock<Vec<Event>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: &Event) {
        self.events.write().push(event.clone());
    }

    fn name(&self) -> &str {
        "recording"
    }
}
