//! Single-instance model broker.
//!
//! Owns the one native engine the process may hold and serialises every
//! generation through a FIFO queue. State lives behind a synchronous mutex that
//! is never held across an `.await`; every flag is re-read after a suspension
//! point.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::panic::AssertUnwindSafe;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use crate::app::events::{Event, EventBus};
use crate::core::{BrokerError, ChatMessage, ConversationId, ModelId};
use crate::infra::assets::AssetManager;
use crate::infra::engine::{is_interrupted, EngineCallbacks, EngineEvents, EngineFactory, InferenceEngine};

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Unloaded,
    Loading,
    Loaded,
    Processing,
    Terminated,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Processing => "processing",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Observer bound to a queued request. Only the request being processed
/// receives events.
pub trait GenerationCallbacks: Send + Sync {
    fn on_token(&self, token: &str);
    fn on_history_update(&self, messages: &[ChatMessage]);
}

#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub system_prompt: Option<String>,
}

type LoadFuture = Shared<BoxFuture<'static, BrokerResult<()>>>;

struct PendingLoad {
    model: ModelId,
    future: LoadFuture,
}

struct QueuedRequest {
    conversation: ConversationId,
    messages: Vec<ChatMessage>,
    callbacks: Option<Arc<dyn GenerationCallbacks>>,
    reply: oneshot::Sender<BrokerResult<String>>,
}

struct ActiveRequest {
    conversation: ConversationId,
    callbacks: Option<Arc<dyn GenerationCallbacks>>,
    interrupted: bool,
    tokens: usize,
}

struct DeferredUnload {
    clear_callbacks: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

struct BrokerInner {
    state: BrokerState,
    model: Option<ModelId>,
    last_model: Option<ModelId>,
    engine: Option<Arc<dyn InferenceEngine>>,
    loading: Option<PendingLoad>,
    queue: VecDeque<QueuedRequest>,
    callbacks: HashMap<ConversationId, Arc<dyn GenerationCallbacks>>,
    active: Option<ActiveRequest>,
    deferred_unload: Option<DeferredUnload>,
    // Bumped by every load and teardown; engine callbacks from an older epoch are dropped.
    epoch: u64,
}

impl BrokerInner {
    fn new() -> Self {
        Self {
            state: BrokerState::Unloaded,
            model: None,
            last_model: None,
            engine: None,
            loading: None,
            queue: VecDeque::new(),
            callbacks: HashMap::new(),
            active: None,
            deferred_unload: None,
            epoch: 0,
        }
    }

    fn is_ready(&self) -> bool {
        matches!(self.state, BrokerState::Loaded | BrokerState::Processing)
    }

    fn begin_teardown(&mut self, clear_callbacks: bool, waiters: Vec<oneshot::Sender<()>>) -> Teardown {
        self.epoch += 1;
        self.state = BrokerState::Terminated;
        self.loading = None;
        self.active = None;
        if clear_callbacks {
            self.callbacks.clear();
        }
        Teardown {
            model: self.model.take(),
            engine: self.engine.take(),
            rejected: self.queue.drain(..).collect(),
            waiters,
        }
    }
}

/// Work left over after the state flipped to `Terminated`; runs without the lock.
struct Teardown {
    model: Option<ModelId>,
    engine: Option<Arc<dyn InferenceEngine>>,
    rejected: Vec<QueuedRequest>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Teardown {
    async fn finish(self, events: &EventBus) {
        for request in self.rejected {
            let _ = request.reply.send(Err(BrokerError::cancelled("model unloaded")));
        }
        if let Some(engine) = self.engine {
            engine.dispose().await;
        }
        if let Some(model) = self.model {
            tracing::info!(%model, "model unloaded");
            events.publish(Event::ModelUnloaded { model });
        }
        for waiter in self.waiters {
            let _ = waiter.send(());
        }
    }
}

struct BrokerShared {
    factory: Arc<dyn EngineFactory>,
    assets: Arc<dyn AssetManager>,
    events: Arc<EventBus>,
    config: BrokerConfig,
    inner: Mutex<BrokerInner>,
}

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct ModelBroker {
    shared: Arc<BrokerShared>,
}

impl ModelBroker {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        assets: Arc<dyn AssetManager>,
        events: Arc<EventBus>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                factory,
                assets,
                events,
                config,
                inner: Mutex::new(BrokerInner::new()),
            }),
        }
    }

    pub fn state(&self) -> BrokerState {
        self.shared.inner.lock().state
    }

    pub fn loaded_model(&self) -> Option<ModelId> {
        let inner = self.shared.inner.lock();
        if inner.is_ready() {
            inner.model
        } else {
            None
        }
    }

    pub fn is_loaded_with(&self, model: ModelId) -> bool {
        self.loaded_model() == Some(model)
    }

    pub fn current_conversation(&self) -> Option<ConversationId> {
        self.shared
            .inner
            .lock()
            .active
            .as_ref()
            .map(|a| a.conversation.clone())
    }

    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    pub fn register_callbacks(&self, conversation: ConversationId, callbacks: Arc<dyn GenerationCallbacks>) {
        self.shared.inner.lock().callbacks.insert(conversation, callbacks);
    }

    pub fn unregister_callbacks(&self, conversation: &ConversationId) {
        self.shared.inner.lock().callbacks.remove(conversation);
    }

    /// Makes `model` the loaded model.
    ///
    /// Concurrent callers asking for the model that is already loading share
    /// one load. A different loaded model is unloaded first; if it is busy the
    /// switch waits for the in-flight request to settle.
    pub async fn load(&self, model: ModelId) -> BrokerResult<()> {
        enum Step {
            Done,
            Await(LoadFuture),
            AwaitOther(LoadFuture),
            Switch(ModelId),
        }

        loop {
            let step = {
                let mut inner = self.shared.inner.lock();
                match inner.state {
                    BrokerState::Loaded | BrokerState::Processing if inner.model == Some(model) => Step::Done,
                    BrokerState::Loaded | BrokerState::Processing => {
                        Step::Switch(inner.model.unwrap_or(model))
                    }
                    BrokerState::Loading => match &inner.loading {
                        Some(pending) if pending.model == model => Step::Await(pending.future.clone()),
                        Some(pending) => Step::AwaitOther(pending.future.clone()),
                        None => Step::Await(self.start_load(&mut inner, model)),
                    },
                    BrokerState::Unloaded | BrokerState::Terminated => Step::Await(self.start_load(&mut inner, model)),
                }
            };

            match step {
                Step::Done => return Ok(()),
                Step::Await(future) => return future.await,
                Step::AwaitOther(future) => {
                    let _ = future.await;
                }
                Step::Switch(current) => {
                    tracing::info!(from = %current, to = %model, "switching models");
                    self.unload_with(false).await;
                }
            }
        }
    }

    fn start_load(&self, inner: &mut BrokerInner, model: ModelId) -> LoadFuture {
        inner.state = BrokerState::Loading;
        inner.last_model = Some(model);
        inner.epoch += 1;
        let epoch = inner.epoch;

        let broker = self.clone();
        let task = tokio::spawn(async move { broker.run_load(model, epoch).await });
        let future = async move {
            task.await
                .unwrap_or_else(|e| Err(BrokerError::Load(format!("load task failed: {}", e))))
        }
        .boxed()
        .shared();

        inner.loading = Some(PendingLoad {
            model,
            future: future.clone(),
        });
        future
    }

    async fn run_load(&self, model: ModelId, epoch: u64) -> BrokerResult<()> {
        tracing::info!(%model, "loading model");
        let events = &self.shared.events;
        events.publish(Event::ModelLoading { model, progress: 0.0 });

        match self.construct_engine(model, epoch).await {
            Ok(engine) => {
                let stale = {
                    let mut inner = self.shared.inner.lock();
                    if inner.epoch != epoch {
                        true
                    } else {
                        inner.state = BrokerState::Loaded;
                        inner.model = Some(model);
                        inner.engine = Some(Arc::clone(&engine));
                        inner.loading = None;
                        false
                    }
                };
                if stale {
                    tracing::debug!(%model, "discarding engine from an invalidated load");
                    engine.dispose().await;
                    return Err(BrokerError::cancelled("model unloaded while loading"));
                }

                tracing::info!(%model, "model loaded");
                events.publish(Event::ModelLoaded { model });
                self.pump();
                Ok(())
            }
            Err(err) => {
                {
                    let mut inner = self.shared.inner.lock();
                    if inner.epoch == epoch {
                        inner.state = BrokerState::Unloaded;
                        inner.loading = None;
                    }
                }
                events.publish(Event::ModelLoadFailed {
                    model,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn construct_engine(&self, model: ModelId, epoch: u64) -> BrokerResult<Arc<dyn InferenceEngine>> {
        let paths = self
            .shared
            .assets
            .ensure_model_present(&model)
            .await
            .map_err(|e| BrokerError::Load(format!("{:#}", e)))?;

        let guard = Arc::new(GuardedCallbacks {
            broker: Arc::downgrade(&self.shared),
            epoch,
        });
        let engine = self
            .shared
            .factory
            .create(&model.descriptor(), EngineCallbacks::new(guard));

        let events = Arc::clone(&self.shared.events);
        let progress = move |progress: f32| events.publish(Event::ModelLoading { model, progress });

        if let Err(e) = engine.load(&paths, &progress).await {
            engine.dispose().await;
            return Err(BrokerError::Load(format!("{:#}", e)));
        }
        if let Err(e) = engine.configure(self.shared.config.system_prompt.as_deref()).await {
            engine.dispose().await;
            return Err(BrokerError::Load(format!("{:#}", e)));
        }
        Ok(engine)
    }

    /// Queues a full-transcript generation for `conversation` and waits for its turn.
    ///
    /// Requests are served strictly in call order. The reply is also delivered
    /// as a history update (`messages` plus the assistant reply) to the
    /// callbacks registered for `conversation` at call time.
    pub async fn generate(&self, conversation: &ConversationId, messages: Vec<ChatMessage>) -> BrokerResult<String> {
        self.ensure_loaded().await?;

        let (receiver, position) = {
            let mut inner = self.shared.inner.lock();
            if !inner.is_ready() {
                return Err(BrokerError::NotLoaded(format!(
                    "broker is {} after waiting for the model",
                    inner.state
                )));
            }
            let (reply, receiver) = oneshot::channel();
            let callbacks = inner.callbacks.get(conversation).cloned();
            inner.queue.push_back(QueuedRequest {
                conversation: conversation.clone(),
                messages,
                callbacks,
                reply,
            });
            let ahead = inner.queue.len() - 1 + usize::from(inner.active.is_some());
            (receiver, ahead)
        };

        tracing::debug!(%conversation, position, "generation queued");
        self.shared.events.publish(Event::GenerationQueued {
            conversation: conversation.clone(),
            position,
        });
        self.pump();

        receiver
            .await
            .unwrap_or_else(|_| Err(BrokerError::cancelled("request dropped by broker")))
    }

    async fn ensure_loaded(&self) -> BrokerResult<()> {
        enum Readiness {
            Ready,
            Wait(LoadFuture),
            Heal(ModelId),
            Never,
        }

        let readiness = {
            let inner = self.shared.inner.lock();
            match inner.state {
                BrokerState::Loaded | BrokerState::Processing => Readiness::Ready,
                BrokerState::Loading => inner
                    .loading
                    .as_ref()
                    .map(|p| Readiness::Wait(p.future.clone()))
                    .unwrap_or(Readiness::Never),
                BrokerState::Unloaded | BrokerState::Terminated => {
                    inner.last_model.map(Readiness::Heal).unwrap_or(Readiness::Never)
                }
            }
        };

        match readiness {
            Readiness::Ready => Ok(()),
            Readiness::Wait(future) => {
                future.await?;
                self.check_ready()
            }
            Readiness::Heal(model) => {
                tracing::warn!(%model, "model not loaded; attempting one reload");
                self.load(model).await?;
                self.check_ready()
            }
            Readiness::Never => Err(BrokerError::NotLoaded("no model has been loaded".to_string())),
        }
    }

    fn check_ready(&self) -> BrokerResult<()> {
        let state = self.state();
        match state {
            BrokerState::Loaded | BrokerState::Processing => Ok(()),
            other => Err(BrokerError::NotLoaded(format!("broker is {} after reload attempt", other))),
        }
    }

    /// Starts the next queued request if the engine is idle.
    fn pump(&self) {
        let (request, engine) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != BrokerState::Loaded || inner.active.is_some() {
                return;
            }
            let Some(engine) = inner.engine.clone() else {
                return;
            };
            let Some(request) = inner.queue.pop_front() else {
                return;
            };
            inner.state = BrokerState::Processing;
            // Under the lock, so no interrupt for this request can land before it.
            engine.clear_interrupt();
            inner.active = Some(ActiveRequest {
                conversation: request.conversation.clone(),
                callbacks: request.callbacks.clone(),
                interrupted: false,
                tokens: 0,
            });
            (request, engine)
        };

        let broker = self.clone();
        tokio::spawn(async move { broker.process(request, engine).await });
    }

    async fn process(&self, request: QueuedRequest, engine: Arc<dyn InferenceEngine>) {
        let QueuedRequest {
            conversation,
            messages,
            callbacks,
            reply,
        } = request;
        let events = &self.shared.events;

        tracing::debug!(%conversation, messages = messages.len(), "generation started");
        events.publish(Event::GenerationStarted {
            conversation: conversation.clone(),
        });

        let outcome = match AssertUnwindSafe(engine.generate(&messages)).catch_unwind().await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                tracing::error!(%conversation, "engine panicked during generation");
                None
            }
        };

        let (interrupted, tokens) = {
            let inner = self.shared.inner.lock();
            inner
                .active
                .as_ref()
                .map(|a| (a.interrupted, a.tokens))
                .unwrap_or((false, 0))
        };

        let result = match outcome {
            None => Err(BrokerError::generation("engine panicked")),
            Some(Ok(text)) => {
                if let Some(callbacks) = &callbacks {
                    let mut history = messages;
                    history.push(ChatMessage::assistant(text.clone()));
                    callbacks.on_history_update(&history);
                }
                Ok(text)
            }
            Some(Err(err)) if interrupted || is_interrupted(&err) => Err(BrokerError::Cancelled(format!("{:#}", err))),
            Some(Err(err)) => Err(BrokerError::Generation(format!("{:#}", err))),
        };

        let teardown = {
            let mut inner = self.shared.inner.lock();
            inner.active = None;
            if inner.state == BrokerState::Processing {
                inner.state = BrokerState::Loaded;
            }
            inner
                .deferred_unload
                .take()
                .map(|deferred| inner.begin_teardown(deferred.clear_callbacks, deferred.waiters))
        };

        match &result {
            Ok(_) => events.publish(Event::GenerationCompleted {
                conversation: conversation.clone(),
                tokens,
            }),
            Err(err) => events.publish(Event::GenerationFailed {
                conversation: conversation.clone(),
                error: err.to_string(),
            }),
        }
        let _ = reply.send(result);

        match teardown {
            Some(teardown) => teardown.finish(events).await,
            None => self.pump(),
        }
    }

    /// Asks the engine to stop the running generation. Returns whether a
    /// request was running. The broker stays `Processing` until that request
    /// settles.
    pub fn interrupt(&self) -> bool {
        self.interrupt_matching(|_| true)
    }

    /// Like [`interrupt`](Self::interrupt) but only when `conversation` is the one running.
    pub fn interrupt_conversation(&self, conversation: &ConversationId) -> bool {
        self.interrupt_matching(|active| active == conversation)
    }

    fn interrupt_matching<F>(&self, matches: F) -> bool
    where
        F: Fn(&ConversationId) -> bool,
    {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        match (inner.active.as_mut(), inner.engine.as_ref()) {
            // Signalled under the lock so it cannot reach the next request after `clear_interrupt`.
            (Some(active), Some(engine)) if matches(&active.conversation) => {
                active.interrupted = true;
                engine.interrupt();
                true
            }
            _ => false,
        }
    }

    /// Disposes the engine, rejects queued requests, and clears registered callbacks.
    ///
    /// While a request is processing, the unload is recorded and this call
    /// waits until that request settles before tearing down.
    pub async fn unload(&self) {
        self.unload_with(true).await;
    }

    /// Unloads and forgets the last model so `generate` will not reload it.
    pub async fn shutdown(&self) {
        self.unload_with(true).await;
        self.shared.inner.lock().last_model = None;
    }

    async fn unload_with(&self, clear_callbacks: bool) {
        enum Action {
            Nothing,
            Now(Teardown),
            Deferred(oneshot::Receiver<()>),
        }

        let action = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            match inner.state {
                BrokerState::Processing => {
                    let (tx, rx) = oneshot::channel();
                    let deferred = inner.deferred_unload.get_or_insert_with(|| DeferredUnload {
                        clear_callbacks: false,
                        waiters: Vec::new(),
                    });
                    deferred.clear_callbacks |= clear_callbacks;
                    deferred.waiters.push(tx);
                    Action::Deferred(rx)
                }
                BrokerState::Loaded | BrokerState::Loading => {
                    Action::Now(inner.begin_teardown(clear_callbacks, Vec::new()))
                }
                BrokerState::Unloaded | BrokerState::Terminated => {
                    if clear_callbacks {
                        inner.callbacks.clear();
                    }
                    Action::Nothing
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Now(teardown) => teardown.finish(&self.shared.events).await,
            Action::Deferred(done) => {
                tracing::info!("unload deferred until the running generation settles");
                let _ = done.await;
            }
        }
    }
}

/// Engine callbacks that go quiet once the engine's broker epoch has passed.
struct GuardedCallbacks {
    broker: Weak<BrokerShared>,
    epoch: u64,
}

impl GuardedCallbacks {
    fn target(&self, count_token: bool) -> Option<Arc<dyn GenerationCallbacks>> {
        let shared = self.broker.upgrade()?;
        let mut inner = shared.inner.lock();
        if inner.epoch != self.epoch || inner.state != BrokerState::Processing {
            return None;
        }
        let active = inner.active.as_mut()?;
        if count_token {
            active.tokens += 1;
        }
        active.callbacks.clone()
    }
}

impl EngineEvents for GuardedCallbacks {
    fn on_token(&self, token: &str) {
        if let Some(callbacks) = self.target(true) {
            callbacks.on_token(token);
        }
    }

    fn on_history(&self, messages: &[ChatMessage]) {
        if let Some(callbacks) = self.target(false) {
            callbacks.on_history_update(messages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ModelAssetPaths, ModelDescriptor};
    use crate::infra::engine::{Interrupted, ProgressFn};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubAssets;

    #[async_trait]
    impl AssetManager for StubAssets {
        async fn ensure_model_present(&self, model: &ModelId) -> crate::core::Result<ModelAssetPaths> {
            let dir = PathBuf::from("/models").join(model.as_str());
            Ok(ModelAssetPaths {
                weights: dir.join("w.gguf"),
                tokenizer: dir.join("tokenizer.json"),
                tokenizer_config: dir.join("tokenizer_config.json"),
            })
        }
    }

    struct EchoEngine {
        callbacks: EngineCallbacks,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl InferenceEngine for EchoEngine {
        async fn load(&self, _paths: &ModelAssetPaths, progress: &ProgressFn) -> crate::core::Result<()> {
            progress(1.0);
            Ok(())
        }

        async fn configure(&self, _system_prompt: Option<&str>) -> crate::core::Result<()> {
            Ok(())
        }

        async fn generate(&self, messages: &[ChatMessage]) -> crate::core::Result<String> {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(Interrupted.into());
            }
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.callbacks.token(&last);
            Ok(format!("echo: {}", last))
        }

        fn interrupt(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn clear_interrupt(&self) {
            self.stopped.store(false, Ordering::SeqCst);
        }

        async fn dispose(&self) {}
    }

    #[derive(Default)]
    struct EchoFactory {
        created: AtomicUsize,
    }

    impl EngineFactory for EchoFactory {
        fn create(&self, _descriptor: &ModelDescriptor, callbacks: EngineCallbacks) -> Arc<dyn InferenceEngine> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Arc::new(EchoEngine {
                callbacks,
                stopped: AtomicBool::new(false),
            })
        }
    }

    struct Capture {
        tokens: Mutex<Vec<String>>,
        history: Mutex<Vec<ChatMessage>>,
    }

    impl GenerationCallbacks for Capture {
        fn on_token(&self, token: &str) {
            self.tokens.lock().push(token.to_string());
        }

        fn on_history_update(&self, messages: &[ChatMessage]) {
            *self.history.lock() = messages.to_vec();
        }
    }

    fn broker(factory: Arc<EchoFactory>) -> ModelBroker {
        ModelBroker::new(factory, Arc::new(StubAssets), Arc::new(EventBus::new()), BrokerConfig::default())
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let factory = Arc::new(EchoFactory::default());
        let broker = broker(factory.clone());
        assert_eq!(broker.state(), BrokerState::Unloaded);

        broker.load(ModelId::Qwen25_0_5B).await.unwrap();
        assert_eq!(broker.state(), BrokerState::Loaded);
        assert_eq!(broker.loaded_model(), Some(ModelId::Qwen25_0_5B));

        broker.load(ModelId::Qwen25_0_5B).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        broker.unload().await;
        assert_eq!(broker.state(), BrokerState::Terminated);
        assert_eq!(broker.loaded_model(), None);
    }

    #[tokio::test]
    async fn test_generate_routes_to_bound_callbacks() {
        let broker = broker(Arc::new(EchoFactory::default()));
        let conversation = ConversationId::from("c1");
        let capture = Arc::new(Capture {
            tokens: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
        });
        broker.register_callbacks(conversation.clone(), capture.clone());
        broker.load(ModelId::Llama32_1B).await.unwrap();

        let reply = broker
            .generate(&conversation, vec![ChatMessage::user("ping")])
            .await
            .unwrap();

        assert_eq!(reply, "echo: ping");
        assert_eq!(capture.tokens.lock().clone(), vec!["ping".to_string()]);
        assert_eq!(
            capture.history.lock().clone(),
            vec![ChatMessage::user("ping"), ChatMessage::assistant("echo: ping")]
        );
        assert_eq!(broker.state(), BrokerState::Loaded);
    }

    #[tokio::test]
    async fn test_generate_without_any_model_fails() {
        let broker = broker(Arc::new(EchoFactory::default()));
        let err = broker
            .generate(&ConversationId::from("c1"), vec![ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotLoaded(_)));
    }

    #[tokio::test]
    async fn test_generate_self_heals_after_unload() {
        let factory = Arc::new(EchoFactory::default());
        let broker = broker(factory.clone());
        broker.load(ModelId::Llama32_1B).await.unwrap();
        broker.unload().await;

        let reply = broker
            .generate(&ConversationId::from("c1"), vec![ChatMessage::user("again")])
            .await
            .unwrap();
        assert_eq!(reply, "echo: again");
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        broker.shutdown().await;
        let err = broker
            .generate(&ConversationId::from("c1"), vec![ChatMessage::user("again")])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotLoaded(_)));
    }

    #[tokio::test]
    async fn test_stray_interrupt_does_not_cancel_next_request() {
        let broker = broker(Arc::new(EchoFactory::default()));
        broker.load(ModelId::Llama32_1B).await.unwrap();

        // A stop signal that reaches the engine after its request already settled.
        let engine = broker.shared.inner.lock().engine.clone().unwrap();
        engine.interrupt();

        let reply = broker
            .generate(&ConversationId::from("c1"), vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(reply, "echo: hi");
    }
}
