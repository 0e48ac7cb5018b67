use anyhow::bail;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::core::{ModelAssetPaths, ModelId, Result};

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

#[async_trait]
pub trait AssetManager: Send + Sync {
    async fn ensure_model_present(&self, model: &ModelId) -> Result<ModelAssetPaths>;
}

/// Resolves model files under `<root>/<model-id>/`.
///
/// Downloading is not handled here; missing files are reported by name.
pub struct LocalAssetManager {
    models_dir: PathBuf,
}

impl LocalAssetManager {
    pub fn new<P: AsRef<Path>>(models_dir: P) -> Self {
        Self {
            models_dir: models_dir.as_ref().to_path_buf(),
        }
    }

    pub fn default_models_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hearth")
            .join("models")
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn paths_for(&self, model: &ModelId) -> ModelAssetPaths {
        let dir = self.models_dir.join(model.as_str());
        ModelAssetPaths {
            weights: dir.join(model.descriptor().weights_file),
            tokenizer: dir.join(TOKENIZER_FILE),
            tokenizer_config: dir.join(TOKENIZER_CONFIG_FILE),
        }
    }

    pub fn missing_files(&self, model: &ModelId) -> Vec<PathBuf> {
        let paths = self.paths_for(model);
        [paths.weights, paths.tokenizer, paths.tokenizer_config]
            .into_iter()
            .filter(|p| !p.is_file())
            .collect()
    }

    pub fn is_present(&self, model: &ModelId) -> bool {
        self.missing_files(model).is_empty()
    }
}

impl Default for LocalAssetManager {
    fn default() -> Self {
        Self::new(Self::default_models_dir())
    }
}

#[async_trait]
impl AssetManager for LocalAssetManager {
    async fn ensure_model_present(&self, model: &ModelId) -> Result<ModelAssetPaths> {
        let missing = self.missing_files(model);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            bail!("assets for {} are missing: {}", model, names.join(", "));
        }
        Ok(self.paths_for(model))
    }
}
