#![allow(dead_code)]

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use hearth::app::broker::GenerationCallbacks;
use hearth::app::events::RecordingHandler;
use hearth::app::multiplexer::ConversationListener;
use hearth::infra::engine::{EngineCallbacks, EngineFactory, InferenceEngine, Interrupted, ProgressFn};
use hearth::{
    AssetManager, BrokerConfig, ChatMessage, EventBus, ModelAssetPaths, ModelBroker, ModelDescriptor, ModelId,
};

/// Shared knobs and observations for every engine the factory builds.
///
/// Prompts drive behaviour: `hold ...` streams `partial` and then blocks
/// until `release` or an interrupt, `late ...` waits for `release` before it
/// looks at the stop flag, `fail ...` errors, `panic ...` panics, anything
/// else echoes one token per word.
#[derive(Default)]
pub struct Script {
    pub created: AtomicUsize,
    pub loaded: AtomicUsize,
    pub disposed: AtomicUsize,
    pub fail_load: AtomicBool,
    pub load_gate: Mutex<Option<Arc<Notify>>>,
    pub release: Notify,
    pub started: Notify,
    pub prompts: Mutex<Vec<String>>,
    pub models: Mutex<Vec<ModelId>>,
    pub callbacks: Mutex<Vec<EngineCallbacks>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl Script {
    pub fn gate_loads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.load_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

pub struct ScriptedEngine {
    script: Arc<Script>,
    callbacks: EngineCallbacks,
    stopped: AtomicBool,
    stop: Notify,
}

impl ScriptedEngine {
    async fn respond(&self, prompt: &str) -> hearth::Result<String> {
        tokio::task::yield_now().await;
        if prompt.starts_with("late") {
            self.script.started.notify_one();
            self.script.release.notified().await;
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Interrupted.into());
        }
        if prompt.starts_with("fail") {
            bail!("engine exploded");
        }
        if prompt.starts_with("hold") {
            self.callbacks.token("partial");
            self.script.started.notify_one();
            loop {
                tokio::select! {
                    _ = self.script.release.notified() => break,
                    _ = self.stop.notified() => {
                        if self.stopped.load(Ordering::SeqCst) {
                            return Err(Interrupted.into());
                        }
                    }
                }
            }
        }
        for word in prompt.split_whitespace() {
            self.callbacks.token(word);
        }
        Ok(format!("reply to {}", prompt))
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn load(&self, _paths: &ModelAssetPaths, progress: &ProgressFn) -> hearth::Result<()> {
        progress(0.5);
        let gate = self.script.load_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.script.fail_load.load(Ordering::SeqCst) {
            bail!("corrupt weights");
        }
        self.script.loaded.fetch_add(1, Ordering::SeqCst);
        progress(1.0);
        Ok(())
    }

    async fn configure(&self, _system_prompt: Option<&str>) -> hearth::Result<()> {
        Ok(())
    }

    async fn generate(&self, messages: &[ChatMessage]) -> hearth::Result<String> {
        let prompt = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        if prompt.starts_with("panic") {
            panic!("engine bug on {:?}", prompt);
        }
        let running = self.script.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_active.fetch_max(running, Ordering::SeqCst);
        self.script.prompts.lock().push(prompt.clone());

        let result = self.respond(&prompt).await;
        self.script.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn interrupt(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }

    fn clear_interrupt(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    async fn dispose(&self) {
        self.script.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ScriptedFactory {
    pub script: Arc<Script>,
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, descriptor: &ModelDescriptor, callbacks: EngineCallbacks) -> Arc<dyn InferenceEngine> {
        self.script.created.fetch_add(1, Ordering::SeqCst);
        self.script.models.lock().push(descriptor.id);
        self.script.callbacks.lock().push(callbacks.clone());
        Arc::new(ScriptedEngine {
            script: Arc::clone(&self.script),
            callbacks,
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        })
    }
}

#[derive(Default)]
pub struct CountingAssets {
    pub fetched: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl AssetManager for CountingAssets {
    async fn ensure_model_present(&self, model: &ModelId) -> hearth::Result<ModelAssetPaths> {
        self.fetched.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("missing files for {}", model);
        }
        let dir = PathBuf::from("/models").join(model.as_str());
        Ok(ModelAssetPaths {
            weights: dir.join("model.gguf"),
            tokenizer: dir.join("tokenizer.json"),
            tokenizer_config: dir.join("tokenizer_config.json"),
        })
    }
}

pub struct Harness {
    pub script: Arc<Script>,
    pub assets: Arc<CountingAssets>,
    pub recorder: RecordingHandler,
    pub broker: ModelBroker,
}

impl Harness {
    pub fn new() -> Self {
        let script = Arc::new(Script::default());
        let assets = Arc::new(CountingAssets::default());
        let recorder = RecordingHandler::new();
        let events = Arc::new(EventBus::new());
        events.subscribe(recorder.clone());

        let broker = ModelBroker::new(
            Arc::new(ScriptedFactory {
                script: Arc::clone(&script),
            }),
            assets.clone(),
            events,
            BrokerConfig::default(),
        );
        Self {
            script,
            assets,
            recorder,
            broker,
        }
    }
}

/// Records what reaches one observer, either as broker callbacks or as a
/// multiplexer listener.
#[derive(Default)]
pub struct Capture {
    pub tokens: Mutex<Vec<String>>,
    pub histories: Mutex<Vec<Vec<ChatMessage>>>,
}

impl Capture {
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    pub fn last_history(&self) -> Option<Vec<ChatMessage>> {
        self.histories.lock().last().cloned()
    }
}

impl GenerationCallbacks for Capture {
    fn on_token(&self, token: &str) {
        self.tokens.lock().push(token.to_string());
    }

    fn on_history_update(&self, messages: &[ChatMessage]) {
        self.histories.lock().push(messages.to_vec());
    }
}

impl ConversationListener for Capture {
    fn on_token(&self, token: &str) -> hearth::Result<()> {
        self.tokens.lock().push(token.to_string());
        Ok(())
    }

    fn on_history_update(&self, messages: &[ChatMessage]) -> hearth::Result<()> {
        self.histories.lock().push(messages.to_vec());
        Ok(())
    }
}

/// Polls `condition` until it holds, failing the test after a second.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}
