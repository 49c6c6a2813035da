use crate::engine::LifecycleState;

pub type Result<T> = std::result::Result<T, CorrectorError>;

/// Every failure the correction engine can surface to its host.
///
/// `NotReady` and `Busy` are transient: hosts typically show them as a
/// "loading" or "working" state and retry later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrectorError {
    #[error("Malformed vocabulary: {0}")]
    Format(String),
    #[error("Engine not ready (state: {0:?})")]
    NotReady(LifecycleState),
    #[error("A correction is already in progress")]
    Busy,
    #[error("Scoring function returned no usable output: {0}")]
    NoOutput(String),
    #[error("Scoring function failed mid-generation: {0}")]
    Correction(String),
    #[error("Correction cancelled by host")]
    Cancelled,
    #[error("Resource unavailable: {0}")]
    Resource(String),
    #[error("Failed to construct scoring session: {0}")]
    Session(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CorrectorError {
    /// True for errors a host should treat as "try again shortly".
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotReady(_) | Self::Busy)
    }
}
