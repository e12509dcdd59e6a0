/// Errors produced by the GPIO engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid chip path: {0}")]
    InvalidChipPath(String),

    #[error("Chip not found: {0}")]
    ChipNotFound(String),

    #[error("Chip access denied: {0}")]
    ChipAccessDenied(String),

    #[error("Line not found: {0}")]
    LineNotFound(String),

    #[error("Line {line} on {chip} already requested")]
    LineAlreadyRequested { chip: String, line: u32 },

    #[error("Line is closed")]
    LineClosed,

    #[error("Manager is closed")]
    ManagerClosed,

    #[error("Operation not valid for line direction")]
    InvalidDirection,

    #[error("Invalid value {0}, expected 0 or 1")]
    InvalidValue(u8),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Read operation failed: {0}")]
    ReadOperation(#[source] std::io::Error),

    #[error("Write operation failed: {0}")]
    WriteOperation(#[source] std::io::Error),

    #[error("Toggle operation failed: {0}")]
    ToggleOperation(#[source] Box<Error>),

    #[error("Context canceled")]
    ContextCanceled,

    #[error("Operation canceled: {0}")]
    OperationCanceled(#[source] Box<Error>),

    #[error("Chip operation failed: {0}")]
    ChipOperation(#[source] std::io::Error),
}

impl Error {
    /// Wrap the cancel cause the way timed operations report it.
    pub(crate) fn canceled() -> Self {
        Error::OperationCanceled(Box::new(Error::ContextCanceled))
    }
}
