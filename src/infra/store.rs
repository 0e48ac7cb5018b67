//! Persisted conversation entries.
//!
//! Only the fields the broker and the recovery service touch are modelled.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{ChatMessage, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Generating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub id: String,
    #[serde(default)]
    pub blocks: Vec<ChatMessage>,
    #[serde(default)]
    pub generation_status: Option<GenerationStatus>,
    #[serde(default)]
    pub generation_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub generation_model_id: Option<String>,
}

impl ConversationEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            blocks: Vec::new(),
            generation_status: None,
            generation_started_at: None,
            generation_model_id: None,
        }
    }
}

#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ConversationEntry>>;

    async fn list_by_status(&self, status: GenerationStatus) -> Result<Vec<ConversationEntry>>;

    async fn upsert(&self, entry: ConversationEntry) -> Result<()>;

    /// Sets the status; `started_at` is only overwritten when `Some`.
    async fn set_generation_status(
        &self,
        id: &str,
        status: GenerationStatus,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn set_blocks(&self, id: &str, blocks: Vec<ChatMessage>) -> Result<()>;
}

#[derive(Default)]
struct Records {
    entries: HashMap<String, ConversationEntry>,
}

impl Records {
    fn get(&self, id: &str) -> Option<ConversationEntry> {
        self.entries.get(id).cloned()
    }

    fn list_by_status(&self, status: GenerationStatus) -> Vec<ConversationEntry> {
        let mut out: Vec<ConversationEntry> = self
            .entries
            .values()
            .filter(|e| e.generation_status == Some(status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut ConversationEntry> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| anyhow!("no entry with id {}", id))
    }

    fn set_status(&mut self, id: &str, status: GenerationStatus, started_at: Option<DateTime<Utc>>) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.generation_status = Some(status);
        if started_at.is_some() {
            entry.generation_started_at = started_at;
        }
        Ok(())
    }
}

/// In-process store; nothing survives a restart.
#[derive(Default)]
pub struct MemoryEntryStore {
    records: RwLock<Records>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn get(&self, id: &str) -> Result<Option<ConversationEntry>> {
        Ok(self.records.read().get(id))
    }

    async fn list_by_status(&self, status: GenerationStatus) -> Result<Vec<ConversationEntry>> {
        Ok(self.records.read().list_by_status(status))
    }

    async fn upsert(&self, entry: ConversationEntry) -> Result<()> {
        self.records.write().entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn set_generation_status(
        &self,
        id: &str,
        status: GenerationStatus,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.records.write().set_status(id, status, started_at)
    }

    async fn set_blocks(&self, id: &str, blocks: Vec<ChatMessage>) -> Result<()> {
        self.records.write().entry_mut(id)?.blocks = blocks;
        Ok(())
    }
}

/// Single JSON file, rewritten after every mutation.
pub struct JsonEntryStore {
    path: PathBuf,
    records: RwLock<Records>,
    // Held across each file write so writes land in mutation order.
    writer: tokio::sync::Mutex<()>,
}

impl JsonEntryStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut records = Records::default();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            if !content.trim().is_empty() {
                let entries: Vec<ConversationEntry> = serde_json::from_str(&content)?;
                records.entries = entries.into_iter().map(|e| (e.id.clone(), e)).collect();
            }
        }

        Ok(Self {
            path,
            records: RwLock::new(records),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hearth")
            .join("conversations.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Records) -> Result<()>,
    {
        let _writer = self.writer.lock().await;
        let content = {
            let mut records = self.records.write();
            f(&mut records)?;
            let mut entries: Vec<&ConversationEntry> = records.entries.values().collect();
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            serde_json::to_string_pretty(&entries)?
        };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_replacing(&path, &content))
            .await
            .map_err(|e| anyhow!("store write task failed: {}", e))?
    }
}

fn write_replacing(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl EntryStore for JsonEntryStore {
    async fn get(&self, id: &str) -> Result<Option<ConversationEntry>> {
        Ok(self.records.read().get(id))
    }

    async fn list_by_status(&self, status: GenerationStatus) -> Result<Vec<ConversationEntry>> {
        Ok(self.records.read().list_by_status(status))
    }

    async fn upsert(&self, entry: ConversationEntry) -> Result<()> {
        self.mutate(|records| {
            records.entries.insert(entry.id.clone(), entry);
            Ok(())
        })
        .await
    }

    async fn set_generation_status(
        &self,
        id: &str,
        status: GenerationStatus,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.mutate(|records| records.set_status(id, status, started_at))
            .await
    }

    async fn set_blocks(&self, id: &str, blocks: Vec<ChatMessage>) -> Result<()> {
        self.mutate(|records| {
            records.entry_mut(id)?.blocks = blocks;
            Ok(())
        })
        .await
    }
}
