use thiserror::Error;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("not initialized: run 'refresh init'")]
    NotInitialized,

    #[error("pipeline busy: {active} is already running")]
    Busy { active: String },

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("step '{0}' cannot be run on its own")]
    StepNotRunnable(String),

    #[error("invalid step registry: {0}")]
    InvalidRegistry(String),

    #[error("invalid trigger time '{0}': expected HH:MM")]
    InvalidTriggerTime(String),

    #[error("invalid utc offset '{0}': expected +HH:MM or -HH:MM")]
    InvalidUtcOffset(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("history store error: {0}")]
    History(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RefreshError>;
