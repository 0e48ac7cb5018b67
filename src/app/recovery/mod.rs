//! Finds generations left `generating` by a crash or a killed process and
//! offers to finish or abandon them.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::app::multiplexer::{ConversationListener, ConversationMultiplexer, NullListener};
use crate::core::{ChatMessage, ModelId, RecoveryError, Role};
use crate::infra::store::{EntryStore, GenerationStatus};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_age: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncompleteGeneration {
    pub entry_id: String,
    pub started_at: DateTime<Utc>,
    pub model_id: String,
    pub model_name: String,
}

pub struct RecoveryService {
    store: Arc<dyn EntryStore>,
    multiplexer: ConversationMultiplexer,
    config: RecoveryConfig,
    scanned: Mutex<Option<Vec<IncompleteGeneration>>>,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn EntryStore>, multiplexer: ConversationMultiplexer, config: RecoveryConfig) -> Self {
        Self {
            store,
            multiplexer,
            config,
            scanned: Mutex::new(None),
        }
    }

    /// Scans the store once per process; later calls return the cached,
    /// still-unresolved set until [`reset`](Self::reset).
    pub async fn check_for_incomplete_generations(&self) -> Result<Vec<IncompleteGeneration>, RecoveryError> {
        if let Some(cached) = self.scanned.lock().as_ref() {
            return Ok(cached.clone());
        }

        let now = Utc::now();
        let entries = self.store.list_by_status(GenerationStatus::Generating).await?;
        let mut found = Vec::new();
        for entry in entries {
            let (Some(started_at), Some(model_id)) = (entry.generation_started_at, entry.generation_model_id) else {
                tracing::debug!(entry = %entry.id, "skipping generating entry without start time or model");
                continue;
            };
            if now.signed_duration_since(started_at) >= self.config.max_age {
                tracing::debug!(entry = %entry.id, %started_at, "skipping stale generation");
                continue;
            }
            found.push(IncompleteGeneration {
                entry_id: entry.id,
                started_at,
                model_name: crate::core::model::display_name(&model_id),
                model_id,
            });
        }
        found.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        if !found.is_empty() {
            tracing::info!(count = found.len(), "found incomplete generations");
        }
        *self.scanned.lock() = Some(found.clone());
        Ok(found)
    }

    pub fn reset(&self) {
        self.scanned.lock().take();
    }

    /// Regenerates the reply for `generation` and persists the outcome.
    pub async fn resume(
        &self,
        generation: &IncompleteGeneration,
        listener: Option<Arc<dyn ConversationListener>>,
    ) -> Result<String, RecoveryError> {
        self.forget(&generation.entry_id);
        match self.regenerate(generation, listener).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                tracing::warn!(entry = %generation.entry_id, error = %err, "resume failed");
                if let Err(mark_err) = self.mark_as_failed(&generation.entry_id).await {
                    tracing::error!(entry = %generation.entry_id, error = %mark_err, "could not mark generation failed");
                }
                Err(err)
            }
        }
    }

    async fn regenerate(
        &self,
        generation: &IncompleteGeneration,
        listener: Option<Arc<dyn ConversationListener>>,
    ) -> Result<String, RecoveryError> {
        let model: ModelId = generation
            .model_id
            .parse()
            .map_err(|_| RecoveryError::UnknownModel(generation.model_id.clone()))?;
        let entry = self
            .store
            .get(&generation.entry_id)
            .await?
            .ok_or_else(|| RecoveryError::EntryNotFound(generation.entry_id.clone()))?;

        let transcript = strip_incomplete_reply(entry.blocks);
        self.store
            .set_blocks(&generation.entry_id, transcript.clone())
            .await?;

        let listener = listener.unwrap_or_else(|| Arc::new(NullListener));
        let handle = self
            .multiplexer
            .get_or_create(generation.entry_id.as_str(), model, listener)
            .await?;

        self.store
            .set_generation_status(&generation.entry_id, GenerationStatus::Generating, Some(Utc::now()))
            .await?;
        tracing::info!(entry = %generation.entry_id, %model, "resuming generation");

        let outcome = handle.generate(transcript.clone()).await;
        handle.delete();
        let reply = outcome?;

        let mut completed = transcript;
        completed.push(ChatMessage::assistant(reply.clone()));
        self.store.set_blocks(&generation.entry_id, completed).await?;
        self.store
            .set_generation_status(&generation.entry_id, GenerationStatus::Completed, None)
            .await?;
        Ok(reply)
    }

    pub async fn dismiss(&self, generation: &IncompleteGeneration) -> Result<(), RecoveryError> {
        self.forget(&generation.entry_id);
        self.mark_as_failed(&generation.entry_id).await
    }

    pub async fn mark_as_failed(&self, entry_id: &str) -> Result<(), RecoveryError> {
        self.store
            .set_generation_status(entry_id, GenerationStatus::Failed, None)
            .await?;
        Ok(())
    }

    fn forget(&self, entry_id: &str) {
        if let Some(cached) = self.scanned.lock().as_mut() {
            cached.retain(|g| g.entry_id != entry_id);
        }
    }
}

fn strip_incomplete_reply(mut blocks: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if blocks.last().is_some_and(|m| m.role == Role::Assistant) {
        blocks.pop();
    }
    blocks
}
