use thiserror::Error;

/// Error kinds the core recognizes, mapped 1:1 onto the run engine's
/// terminal states and exit codes.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("loop exhausted: {0}")]
    Exhaustion(String),
}

impl LoopError {
    /// The exit code a terminal path driven by this error should return,
    /// per the core's error-handling design.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopError::Configuration(_) => 1,
            LoopError::Environment(_) => 1,
            LoopError::Transient(_) => 1,
            LoopError::Verification(_) => 75,
            LoopError::Exhaustion(_) => 1,
        }
    }
}
