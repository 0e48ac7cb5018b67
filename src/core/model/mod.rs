use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Context budget used when a model id is not in the catalog.
pub const DEFAULT_CONTEXT_LIMIT: usize = 2048;

/// Supported on-device models. Equality decides whether the broker must reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelId {
    Qwen25_0_5B,
    Qwen25_1_5B,
    Llama32_1B,
    Llama32_3B,
    SmolLm2_1_7B,
}

/// Chat template used to render a transcript into a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFamily {
    Llama3,
    ChatMl,
}

/// Weight layout inside the GGUF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Llama,
    Qwen2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub id: ModelId,
    pub display_name: &'static str,
    pub context_limit: usize,
    pub family: PromptFamily,
    pub architecture: Architecture,
    pub weights_file: &'static str,
}

impl ModelId {
    pub const ALL: [ModelId; 5] = [
        ModelId::Qwen25_0_5B,
        ModelId::Qwen25_1_5B,
        ModelId::Llama32_1B,
        ModelId::Llama32_3B,
        ModelId::SmolLm2_1_7B,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelId::Qwen25_0_5B => "qwen2.5-0.5b-instruct",
            ModelId::Qwen25_1_5B => "qwen2.5-1.5b-instruct",
            ModelId::Llama32_1B => "llama-3.2-1b-instruct",
            ModelId::Llama32_3B => "llama-3.2-3b-instruct",
            ModelId::SmolLm2_1_7B => "smollm2-1.7b-instruct",
        }
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        match self {
            ModelId::Qwen25_0_5B => ModelDescriptor {
                id: *self,
                display_name: "Qwen 2.5 0.5B Instruct",
                context_limit: 4096,
                family: PromptFamily::ChatMl,
                architecture: Architecture::Qwen2,
                weights_file: "qwen2.5-0.5b-instruct-q4_k_m.gguf",
            },
            ModelId::Qwen25_1_5B => ModelDescriptor {
                id: *self,
                display_name: "Qwen 2.5 1.5B Instruct",
                context_limit: 4096,
                family: PromptFamily::ChatMl,
                architecture: Architecture::Qwen2,
                weights_file: "qwen2.5-1.5b-instruct-q4_k_m.gguf",
            },
            ModelId::Llama32_1B => ModelDescriptor {
                id: *self,
                display_name: "Llama 3.2 1B Instruct",
                context_limit: 8192,
                family: PromptFamily::Llama3,
                architecture: Architecture::Llama,
                weights_file: "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
            },
            ModelId::Llama32_3B => ModelDescriptor {
                id: *self,
                display_name: "Llama 3.2 3B Instruct",
                context_limit: 8192,
                family: PromptFamily::Llama3,
                architecture: Architecture::Llama,
                weights_file: "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
            },
            ModelId::SmolLm2_1_7B => ModelDescriptor {
                id: *self,
                display_name: "SmolLM2 1.7B Instruct",
                context_limit: 2048,
                family: PromptFamily::ChatMl,
                architecture: Architecture::Llama,
                weights_file: "smollm2-1.7b-instruct-q4_k_m.gguf",
            },
        }
    }

    pub fn display_name(&self) -> &'static str {
        self.descriptor().display_name
    }

    pub fn context_limit(&self) -> usize {
        self.descriptor().context_limit
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown model id: {0}")]
pub struct UnknownModel(pub String);

impl FromStr for ModelId {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        ModelId::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownModel(s.to_string()))
    }
}

impl TryFrom<String> for ModelId {
    type Error = UnknownModel;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelId> for String {
    fn from(id: ModelId) -> Self {
        id.as_str().to_string()
    }
}

/// Context limit for a raw model id string; unknown ids get the conservative default.
pub fn context_limit(model_id: &str) -> usize {
    model_id
        .parse::<ModelId>()
        .map(|m| m.context_limit())
        .unwrap_or(DEFAULT_CONTEXT_LIMIT)
}

/// Human-readable name for a raw model id string, falling back to the id itself.
pub fn display_name(model_id: &str) -> String {
    model_id
        .parse::<ModelId>()
        .map(|m| m.display_name().to_string())
        .unwrap_or_else(|_| model_id.to_string())
}

/// Resolved local files for one model, produced by the asset manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAssetPaths {
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_round_trips_through_string() {
        for id in ModelId::ALL {
            assert_eq!(id.as_str().parse::<ModelId>().unwrap(), id);
        }
        assert_eq!("LLAMA-3.2-1B-INSTRUCT".parse::<ModelId>().unwrap(), ModelId::Llama32_1B);
        assert!("gpt-5".parse::<ModelId>().is_err());
    }

    #[test]
    fn test_unknown_model_falls_back_to_default_limit() {
        assert_eq!(context_limit("mystery-model"), DEFAULT_CONTEXT_LIMIT);
        assert_eq!(context_limit("llama-3.2-3b-instruct"), 8192);
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(display_name("qwen2.5-0.5b-instruct"), "Qwen 2.5 0.5B Instruct");
        assert_eq!(display_name("custom-finetune"), "custom-finetune");
    }

    #[test]
    fn test_serde_uses_string_id() {
        let json = serde_json::to_string(&ModelId::SmolLm2_1_7B).unwrap();
        assert_eq!(json, "\"smollm2-1.7b-instruct\"");
        let err = serde_json::from_str::<ModelId>("\"nope\"");
        assert!(err.is_err());
    }
}
