/// Errors produced by the I²C connection layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid timeout")]
    InvalidTimeout,

    #[error("Invalid address {0:#x} for current address mode")]
    InvalidAddress(u16),

    #[error("Bus not found: {0}")]
    BusNotFound(String),

    #[error("Bus access denied: {0}")]
    BusAccessDenied(String),

    #[error("Bus open failed: {0}")]
    BusOpenFailed(#[source] std::io::Error),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Operation failed: {0}")]
    OperationFailed(#[source] std::io::Error),

    #[error("Transaction failed: {0}")]
    TransactionFailed(#[source] std::io::Error),

    #[error("Operation failed after {attempts} attempts: [{joined}]")]
    RetriesExhausted { attempts: usize, joined: String },

    #[error("Context canceled")]
    ContextCanceled,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("SMBus not supported by adapter")]
    SmbusNotSupported,

    #[error("SMBus command not supported by adapter: {0}")]
    SmbusUnsupportedCommand(&'static str),

    #[error("PEC not supported by adapter")]
    PecNotSupported,

    #[error("I3C not supported: {0}")]
    I3cNotSupported(&'static str),

    #[error("Buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("Buffer too large: {len} exceeds {max}")]
    BufferTooLarge { len: usize, max: usize },

    #[error("Invalid PMBus command: {0}")]
    PmbusInvalidCommand(&'static str),

    #[error("PMBus data format error: {0}")]
    PmbusDataFormatError(String),

    #[error("PMBus coefficients invalid: {0}")]
    PmbusCoefficientsInvalid(&'static str),
}

/// Join collected retry-attempt errors into one terminal error.
pub(crate) fn join_attempts(attempts: Vec<Error>) -> Error {
    let joined = attempts
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    Error::RetriesExhausted {
        attempts: attempts.len(),
        joined,
    }
}
