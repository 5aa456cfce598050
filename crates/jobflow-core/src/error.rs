use thiserror::Error;

/// Errors raised while wiring or configuring the engine.
///
/// Job-level failures are never reported through this type; they are
/// recorded on the job itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("duplicate worker id={0}")]
    DuplicateWorker(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },
}
