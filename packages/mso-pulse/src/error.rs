use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: no frame within {0} ms")]
    Timeout(u64),

    #[error("Truncated frame: expected at least {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Acquisition already running")]
    AlreadyRunning,

    #[error("Setting cannot be changed while a run is active: {0}")]
    RunActive(&'static str),

    #[error("Export failed: {0}")]
    Export(String),
}

impl DaqError {
    /// Errors that cost one frame but leave the run going. Anything else
    /// from the transport ends the run.
    pub fn is_frame_level(&self) -> bool {
        matches!(self, DaqError::Timeout(_) | DaqError::TruncatedFrame { .. })
    }
}

pub type Result<T> = std::result::Result<T, DaqError>;
