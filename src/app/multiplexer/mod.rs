//! Fans broker events out to every observer of a conversation.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::app::broker::{BrokerResult, GenerationCallbacks, ModelBroker};
use crate::core::{BrokerError, ChatMessage, ConversationId, ModelId, Result};

/// Observer of one conversation, typically a UI mount or a persistence hook.
///
/// Errors and panics are logged and never reach the broker or other listeners.
pub trait ConversationListener: Send + Sync {
    fn on_token(&self, token: &str) -> Result<()>;
    fn on_history_update(&self, messages: &[ChatMessage]) -> Result<()>;
}

type TokenFn = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;
type HistoryFn = Box<dyn Fn(&[ChatMessage]) -> Result<()> + Send + Sync>;

/// Closure-backed listener.
pub struct FnListener {
    on_token: TokenFn,
    on_history: HistoryFn,
}

impl FnListener {
    pub fn new<T, H>(on_token: T, on_history: H) -> Self
    where
        T: Fn(&str) -> Result<()> + Send + Sync + 'static,
        H: Fn(&[ChatMessage]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            on_token: Box::new(on_token),
            on_history: Box::new(on_history),
        }
    }
}

impl ConversationListener for FnListener {
    fn on_token(&self, token: &str) -> Result<()> {
        (self.on_token)(token)
    }

    fn on_history_update(&self, messages: &[ChatMessage]) -> Result<()> {
        (self.on_history)(messages)
    }
}

pub struct NullListener;

impl ConversationListener for NullListener {
    fn on_token(&self, _token: &str) -> Result<()> {
        Ok(())
    }

    fn on_history_update(&self, _messages: &[ChatMessage]) -> Result<()> {
        Ok(())
    }
}

pub type ListenerId = u64;

struct Broadcaster {
    conversation: ConversationId,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ConversationListener>)>>,
}

impl Broadcaster {
    fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn deliver<F>(&self, event: &'static str, f: F)
    where
        F: Fn(&dyn ConversationListener) -> Result<()>,
    {
        // Snapshot so listeners can add or remove mounts while being called.
        let listeners = self.listeners.read().clone();
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(
                    conversation = %self.conversation,
                    listener = id,
                    event,
                    error = %err,
                    "listener failed"
                ),
                Err(_) => tracing::warn!(
                    conversation = %self.conversation,
                    listener = id,
                    event,
                    "listener panicked"
                ),
            }
        }
    }
}

impl GenerationCallbacks for Broadcaster {
    fn on_token(&self, token: &str) {
        self.deliver("token", |l| l.on_token(token));
    }

    fn on_history_update(&self, messages: &[ChatMessage]) {
        self.deliver("history", |l| l.on_history_update(messages));
    }
}

struct MultiplexerShared {
    broker: ModelBroker,
    conversations: Mutex<HashMap<ConversationId, Arc<Broadcaster>>>,
    next_listener: AtomicU64,
}

#[derive(Clone)]
pub struct ConversationMultiplexer {
    shared: Arc<MultiplexerShared>,
}

impl ConversationMultiplexer {
    pub fn new(broker: ModelBroker) -> Self {
        Self {
            shared: Arc::new(MultiplexerShared {
                broker,
                conversations: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn broker(&self) -> &ModelBroker {
        &self.shared.broker
    }

    /// Attaches `listener` to `conversation` and makes sure `model` is loaded.
    ///
    /// Loading a different model than the one currently held unloads it for
    /// every conversation.
    pub async fn get_or_create(
        &self,
        conversation: impl Into<ConversationId>,
        model: ModelId,
        listener: Arc<dyn ConversationListener>,
    ) -> BrokerResult<ConversationHandle> {
        let conversation = conversation.into();
        let listener_id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);

        {
            // Held until the broker knows the broadcaster, so a concurrent
            // `remove_listener` cannot orphan it in between.
            let mut conversations = self.shared.conversations.lock();
            let broadcaster = Arc::clone(
                conversations
                    .entry(conversation.clone())
                    .or_insert_with(|| Arc::new(Broadcaster::new(conversation.clone()))),
            );
            broadcaster.listeners.write().push((listener_id, listener));
            self.shared
                .broker
                .register_callbacks(conversation.clone(), broadcaster);
        }

        if let Err(err) = self.ensure_model(model).await {
            self.remove_listener(&conversation, listener_id);
            return Err(err);
        }

        tracing::debug!(%conversation, listener = listener_id, %model, "conversation attached");
        Ok(ConversationHandle {
            conversation,
            listener_id,
            model,
            multiplexer: self.clone(),
        })
    }

    async fn ensure_model(&self, model: ModelId) -> BrokerResult<()> {
        let broker = &self.shared.broker;
        if broker.is_loaded_with(model) {
            return Ok(());
        }
        broker.load(model).await?;
        if !broker.is_loaded_with(model) {
            return Err(BrokerError::Load(format!("{} is not loaded after load completed", model)));
        }
        Ok(())
    }

    /// Re-registers the broadcaster in case an unload cleared the broker's registry.
    fn refresh_registration(&self, conversation: &ConversationId) {
        let conversations = self.shared.conversations.lock();
        if let Some(broadcaster) = conversations.get(conversation) {
            self.shared
                .broker
                .register_callbacks(conversation.clone(), Arc::clone(broadcaster) as Arc<dyn GenerationCallbacks>);
        }
    }

    fn remove_listener(&self, conversation: &ConversationId, listener_id: ListenerId) {
        let mut conversations = self.shared.conversations.lock();
        let Some(broadcaster) = conversations.get(conversation) else {
            return;
        };
        let now_empty = {
            let mut listeners = broadcaster.listeners.write();
            listeners.retain(|(id, _)| *id != listener_id);
            listeners.is_empty()
        };
        if now_empty {
            conversations.remove(conversation);
            self.shared.broker.unregister_callbacks(conversation);
            tracing::debug!(%conversation, "last listener detached");
        }
    }

    pub fn listener_count(&self, conversation: &ConversationId) -> usize {
        self.shared
            .conversations
            .lock()
            .get(conversation)
            .map(|b| b.listeners.read().len())
            .unwrap_or(0)
    }

    pub fn conversation_count(&self) -> usize {
        self.shared.conversations.lock().len()
    }

    /// Process-wide teardown: unloads the model and drops every listener.
    pub async fn destroy(&self) {
        self.shared.broker.shutdown().await;
        self.shared.conversations.lock().clear();
    }
}

/// Per-mount view of a conversation returned by
/// [`ConversationMultiplexer::get_or_create`].
pub struct ConversationHandle {
    conversation: ConversationId,
    listener_id: ListenerId,
    model: ModelId,
    multiplexer: ConversationMultiplexer,
}

impl ConversationHandle {
    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn model(&self) -> ModelId {
        self.model
    }

    /// Generates a reply for the full transcript `messages`.
    pub async fn generate(&self, messages: Vec<ChatMessage>) -> BrokerResult<String> {
        self.multiplexer.refresh_registration(&self.conversation);
        self.multiplexer.ensure_model(self.model).await?;
        self.multiplexer
            .broker()
            .generate(&self.conversation, messages)
            .await
    }

    pub async fn send_message(&self, text: impl Into<String>) -> BrokerResult<String> {
        self.generate(vec![ChatMessage::user(text)]).await
    }

    /// Interrupts only if this conversation is the one being processed.
    pub fn interrupt(&self) -> bool {
        self.multiplexer
            .broker()
            .interrupt_conversation(&self.conversation)
    }

    /// Detaches this handle's listener. The model stays loaded.
    pub fn delete(self) {
        self.multiplexer
            .remove_listener(&self.conversation, self.listener_id);
    }
}
