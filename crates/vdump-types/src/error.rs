use thiserror::Error;

pub type Result<T> = std::result::Result<T, VdumpError>;

#[derive(Debug, Error)]
pub enum VdumpError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed record: {0}")]
    Format(String),

    #[error("archive consistency error: {0}")]
    Consistency(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block provider error: {0}")]
    Provider(String),

    #[error("operation cancelled by signal")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl VdumpError {
    /// Provider failures are the only kind the dump loop retries; everything
    /// else aborts on first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VdumpError::Provider(_))
    }
}
