/// Errors produced by the gadget manager and HID writers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("configfs is not mounted at {0}")]
    ConfigFsNotMounted(String),

    #[error("Gadget already exists: {0}")]
    GadgetExists(String),

    #[error("Gadget not found: {0}")]
    GadgetNotFound(String),

    #[error("Gadget is bound: {0}")]
    GadgetBound(String),

    #[error("Gadget is not bound: {0}")]
    GadgetNotBound(String),

    #[error("No available UDC")]
    UdcNotFound,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("HID device not found: {0}")]
    HidDeviceNotFound(String),

    #[error("HID operation failed: {0}")]
    HidOperationFailed(#[source] std::io::Error),

    #[error("Operation timed out")]
    OperationTimeout,

    #[error("Gadget operation failed: {0}")]
    OperationFailed(#[from] std::io::Error),
}

impl Error {
    /// Map an io error on `path`, keeping permission failures distinct.
    pub(crate) fn from_io(path: &std::path::Path, e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied(path.display().to_string())
        } else {
            Error::OperationFailed(e)
        }
    }
}
