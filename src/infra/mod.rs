pub mod assets;
pub mod engine;
pub mod store;

pub use assets::{AssetManager, LocalAssetManager};
pub use engine::{CandleEngineFactory, EngineCallbacks, EngineFactory, InferenceEngine};
pub use store::{ConversationEntry, EntryStore, GenerationStatus, JsonEntryStore, MemoryEntryStore};
