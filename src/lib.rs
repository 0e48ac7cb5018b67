pub mod app;
pub mod core;
pub mod envconfig;
pub mod infra;

pub use core::{
    BrokerError, ChatMessage, ConversationId, ModelAssetPaths, ModelDescriptor, ModelId, RecoveryError, Result,
    Role,
};

pub use app::{
    BrokerConfig, BrokerState, ConversationHandle, ConversationListener, ConversationMultiplexer, Event, EventBus,
    IncompleteGeneration, ModelBroker, RecoveryConfig, RecoveryService,
};

pub use infra::{AssetManager, EngineFactory, EntryStore, InferenceEngine};

pub use envconfig::EnvConfig;
