pub mod broker;
pub mod events;
pub mod multiplexer;
pub mod recovery;

pub use broker::{BrokerConfig, BrokerResult, BrokerState, GenerationCallbacks, ModelBroker};
pub use events::{Event, EventBus, EventHandler, LoggingHandler, RecordingHandler};
pub use multiplexer::{ConversationHandle, ConversationListener, ConversationMultiplexer, FnListener, NullListener};
pub use recovery::{IncompleteGeneration, RecoveryConfig, RecoveryService};
