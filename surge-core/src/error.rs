use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid yaml run options: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid json run options: {0}")]
    Json(#[from] serde_json::Error),

    #[error("`vus` must be a positive integer")]
    InvalidVus,

    #[error("`iterations` must be a positive integer and cannot be combined with `stages`")]
    InvalidIterations,

    #[error("`duration` must be positive, got {0:?}")]
    InvalidDuration(Duration),

    #[error("`stages` must be a non-empty list of {{ duration, target }} with a positive total duration")]
    InvalidStages,

    #[error("`{0}` must be a positive duration")]
    InvalidInterval(&'static str),

    #[error("invalid threshold `{expression}` on `{selector}`: {reason}")]
    InvalidThreshold {
        selector: String,
        expression: String,
        reason: String,
    },

    #[error(transparent)]
    Metrics(#[from] surge_metrics::Error),

    #[error("scheduler fault: {0}")]
    Scheduler(String),
}

impl Error {
    /// Configuration faults are reported before anything is started.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Yaml(_)
                | Self::Json(_)
                | Self::InvalidVus
                | Self::InvalidIterations
                | Self::InvalidDuration(_)
                | Self::InvalidStages
                | Self::InvalidInterval(_)
                | Self::InvalidThreshold { .. }
                | Self::Metrics(_)
        )
    }
}
