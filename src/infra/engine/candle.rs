//! GGUF engine on top of candle's quantized model runtimes.

use anyhow::{anyhow, Error as E};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{quantized_llama, quantized_qwen2};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokenizers::Tokenizer;

use super::template::{render_prompt, stop_markers, strip_stop_markers};
use super::{EngineCallbacks, EngineFactory, InferenceEngine, Interrupted, ProgressFn};
use crate::core::{Architecture, ChatMessage, ModelAssetPaths, ModelDescriptor, PromptFamily, Result};

#[derive(Debug, Clone, Copy)]
pub struct SamplingOptions {
    pub temperature: f64,
    pub top_p: f64,
    pub seed: u64,
    pub max_tokens: usize,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            seed: 299_792_458,
            max_tokens: 512,
        }
    }
}

enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    fn load(path: &Path, architecture: Architecture, device: &Device) -> Result<Self> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| anyhow!("failed to open weights {}: {}", path.display(), e))?;
        let content = gguf_file::Content::read(&mut file)?;

        match architecture {
            Architecture::Llama => Ok(Self::Llama(quantized_llama::ModelWeights::from_gguf(
                content, &mut file, device,
            )?)),
            Architecture::Qwen2 => Ok(Self::Qwen2(quantized_qwen2::ModelWeights::from_gguf(
                content, &mut file, device,
            )?)),
        }
    }

    fn forward(&mut self, input: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input, position)?),
            Self::Qwen2(model) => Ok(model.forward(input, position)?),
        }
    }
}

struct LoadedModel {
    model: RuntimeModel,
    tokenizer: Tokenizer,
    stop_ids: Vec<u32>,
}

pub struct CandleEngine {
    descriptor: ModelDescriptor,
    options: SamplingOptions,
    callbacks: EngineCallbacks,
    device: Device,
    loaded: Arc<Mutex<Option<LoadedModel>>>,
    system_prompt: RwLock<Option<String>>,
    interrupted: Arc<AtomicBool>,
}

impl CandleEngine {
    pub fn new(descriptor: ModelDescriptor, options: SamplingOptions, callbacks: EngineCallbacks) -> Self {
        Self {
            descriptor,
            options,
            callbacks,
            device: Device::Cpu,
            loaded: Arc::new(Mutex::new(None)),
            system_prompt: RwLock::new(None),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl InferenceEngine for CandleEngine {
    async fn load(&self, paths: &ModelAssetPaths, progress: &ProgressFn) -> Result<()> {
        progress(0.0);

        let weights = paths.weights.clone();
        let architecture = self.descriptor.architecture;
        let device = self.device.clone();
        let model = tokio::task::spawn_blocking(move || RuntimeModel::load(&weights, architecture, &device))
            .await
            .map_err(|e| anyhow!("weights loader panicked: {}", e))??;
        progress(0.8);

        let tokenizer = Tokenizer::from_file(&paths.tokenizer).map_err(E::msg)?;
        let stop_ids = resolve_stop_ids(&tokenizer, &paths.tokenizer_config, self.descriptor.family)?;
        tracing::debug!(model = %self.descriptor.id, ?stop_ids, "tokenizer ready");

        *self.loaded.lock() = Some(LoadedModel {
            model,
            tokenizer,
            stop_ids,
        });
        progress(1.0);
        Ok(())
    }

    async fn configure(&self, system_prompt: Option<&str>) -> Result<()> {
        *self.system_prompt.write() = system_prompt.map(str::to_string);
        Ok(())
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let family = self.descriptor.family;
        let prompt = render_prompt(family, messages, self.system_prompt.read().as_deref());
        let loaded = Arc::clone(&self.loaded);
        let interrupted = Arc::clone(&self.interrupted);
        let callbacks = self.callbacks.clone();
        let device = self.device.clone();
        let options = self.options;

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded.lock();
            let loaded = guard.as_mut().ok_or_else(|| anyhow!("model not loaded"))?;
            sample_reply(loaded, &prompt, family, options, &device, &interrupted, &callbacks)
        })
        .await
        .map_err(|e| anyhow!("generation task panicked: {}", e))?
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    async fn dispose(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.loaded.lock().take();
        tracing::debug!(model = %self.descriptor.id, "engine disposed");
    }
}

fn sample_reply(
    loaded: &mut LoadedModel,
    prompt: &str,
    family: PromptFamily,
    options: SamplingOptions,
    device: &Device,
    interrupted: &AtomicBool,
    callbacks: &EngineCallbacks,
) -> Result<String> {
    let prompt_tokens = loaded
        .tokenizer
        .encode(prompt, true)
        .map_err(E::msg)?
        .get_ids()
        .to_vec();
    if prompt_tokens.is_empty() {
        return Err(anyhow!("empty prompt"));
    }

    let mut logits_processor = LogitsProcessor::new(options.seed, Some(options.temperature), Some(options.top_p));
    let mut all_tokens = prompt_tokens;
    let mut generated: Vec<u32> = Vec::new();
    let mut emitted = 0;

    for step in 0..options.max_tokens {
        if interrupted.load(Ordering::SeqCst) {
            return Err(Interrupted.into());
        }

        let (input, position) = if step == 0 {
            (&all_tokens[..], 0)
        } else {
            (&all_tokens[all_tokens.len() - 1..], all_tokens.len() - 1)
        };
        let input = Tensor::new(input, device)?.unsqueeze(0)?;
        let logits = loaded.model.forward(&input, position)?;
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        let next = logits_processor.sample(&logits)?;

        if loaded.stop_ids.contains(&next) {
            break;
        }
        all_tokens.push(next);
        generated.push(next);

        let text = loaded.tokenizer.decode(&generated, false).map_err(E::msg)?;
        let (visible, stopped) = strip_stop_markers(family, &text);
        if let Some(delta) = visible.get(emitted..) {
            if !delta.is_empty() {
                callbacks.token(delta);
                emitted = visible.len();
            }
        }
        if stopped {
            break;
        }
    }

    let text = loaded.tokenizer.decode(&generated, true).map_err(E::msg)?;
    let (reply, _) = strip_stop_markers(family, &text);
    Ok(reply.trim().to_string())
}

fn resolve_stop_ids(tokenizer: &Tokenizer, config_path: &Path, family: PromptFamily) -> Result<Vec<u32>> {
    let mut ids: Vec<u32> = stop_markers(family)
        .iter()
        .filter_map(|marker| tokenizer.token_to_id(marker))
        .collect();

    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow!("failed to read {}: {}", config_path.display(), e))?;
    let config: serde_json::Value = serde_json::from_str(&raw)?;
    let eos = match config.get("eos_token") {
        Some(serde_json::Value::String(token)) => Some(token.as_str()),
        Some(serde_json::Value::Object(obj)) => obj.get("content").and_then(|v| v.as_str()),
        _ => None,
    };
    if let Some(id) = eos.and_then(|token| tokenizer.token_to_id(token)) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    if ids.is_empty() {
        return Err(anyhow!("tokenizer defines no end-of-sequence token"));
    }
    Ok(ids)
}

pub struct CandleEngineFactory {
    options: SamplingOptions,
}

impl CandleEngineFactory {
    pub fn new(options: SamplingOptions) -> Self {
        Self { options }
    }
}

impl Default for CandleEngineFactory {
    fn default() -> Self {
        Self::new(SamplingOptions::default())
    }
}

impl EngineFactory for CandleEngineFactory {
    fn create(&self, descriptor: &ModelDescriptor, callbacks: EngineCallbacks) -> Arc<dyn InferenceEngine> {
        Arc::new(CandleEngine::new(*descriptor, self.options, callbacks))
    }
}
