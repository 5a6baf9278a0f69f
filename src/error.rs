use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    /// Timeout-class failure from the remote backend. The only retryable kind.
    #[error("Transient remote error: {0}")]
    TransientRemote(String),

    #[error("Remote execution error: {0}")]
    FatalRemote(String),

    #[error("Query load error: {0}")]
    Loader(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Result sink error: {0}")]
    Sink(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Polars error: {0}")]
    Polars(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::TransientRemote(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FleetError::Cancelled(_))
    }
}

impl From<polars::prelude::PolarsError> for FleetError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        FleetError::Polars(err.to_string())
    }
}

impl From<csv::Error> for FleetError {
    fn from(err: csv::Error) -> Self {
        FleetError::Csv(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
