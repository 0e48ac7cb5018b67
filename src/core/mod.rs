pub mod context;
pub mod error;
pub mod message;
pub mod model;

pub use context::{estimate_tokens, fits_in_context, truncate_context};
pub use error::{BrokerError, RecoveryError};
pub use message::{ChatMessage, ConversationId, Role};
pub use model::{Architecture, ModelAssetPaths, ModelDescriptor, ModelId, PromptFamily};

pub type Result<T> = anyhow::Result<T>;
