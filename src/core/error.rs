use thiserror::Error;

/// Failure kinds surfaced by the broker and the conversation handles.
///
/// `Clone` so one in-flight load outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Asset resolution or native initialisation failed; the broker is back to `Unloaded`.
    #[error("model load failed: {0}")]
    Load(String),
    /// The engine failed while producing a reply. Only the affected request sees this.
    #[error("generation failed: {0}")]
    Generation(String),
    /// The request was interrupted or dropped by an unload.
    #[error("generation cancelled: {0}")]
    Cancelled(String),
    #[error("model not loaded: {0}")]
    NotLoaded(String),
}

impl BrokerError {
    pub fn load(err: impl std::fmt::Display) -> Self {
        Self::Load(err.to_string())
    }

    pub fn generation(err: impl std::fmt::Display) -> Self {
        Self::Generation(err.to_string())
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_load_failure(&self) -> bool {
        matches!(self, Self::Load(_) | Self::NotLoaded(_))
    }
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("entry store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error(transparent)]
    Generation(#[from] BrokerError),
    #[error("entry not found: {0}")]
    EntryNotFound(String),
    #[error("cannot resume generation for unknown model: {0}")]
    UnknownModel(String),
}
