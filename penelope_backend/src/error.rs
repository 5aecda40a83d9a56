use thiserror::Error;

/// Failures surfaced by the engine adapter and the generation supervisor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PenelopeError {
    /// The inference engine failed mid-request or mid-stream. Fatal to the
    /// current turn; nothing from the turn is committed.
    #[error("model fault: {0}")]
    ModelFault(String),

    /// The engine could not satisfy a grammar constraint.
    #[error("grammar violation: {0}")]
    GrammarViolation(String),

    /// A compute-state handle was stale or issued by another engine.
    #[error("invalid state handle: {0}")]
    StateHandleInvalid(String),

    #[error("config error: {0}")]
    Config(String),
}

impl PenelopeError {
    pub fn fault(message: impl Into<String>) -> Self {
        PenelopeError::ModelFault(message.into())
    }
}

impl From<reqwest::Error> for PenelopeError {
    fn from(e: reqwest::Error) -> Self {
        PenelopeError::ModelFault(e.to_string())
    }
}

pub type PenelopeResult<T> = Result<T, PenelopeError>;
