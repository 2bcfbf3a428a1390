//! Error taxonomy shared by every layer of the driver.

use thiserror::Error;

/// Every fallible operation in this crate returns `Result<T, HiDockError>`.
#[derive(Debug, Error)]
pub enum HiDockError {
    #[error("device {vendor_id:#06x}:{product_id:#06x} not found")]
    NotFound { vendor_id: u16, product_id: u16 },

    #[error("access denied opening the device: {detail}")]
    AccessDenied { detail: String },

    #[error("device is in use by another process")]
    InUseByAnother,

    #[error("USB operation timed out")]
    UsbTimeout,

    #[error("USB endpoint {endpoint:#04x} stalled")]
    UsbPipeError { endpoint: u8 },

    #[error("protocol error: {detail}")]
    ProtocolError { detail: String },

    #[error("connection to device was lost")]
    ConnectionLost,

    #[error("device is busy streaming a file list")]
    Busy,

    #[error("operation was cancelled")]
    OperationCancelled,

    #[error("capability not supported by this device model")]
    NotSupported,

    #[error("health check failed")]
    HealthCheckFailed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusb::Error> for HiDockError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => HiDockError::UsbTimeout,
            rusb::Error::Pipe => HiDockError::UsbPipeError { endpoint: 0 },
            rusb::Error::NoDevice | rusb::Error::Disconnected => HiDockError::ConnectionLost,
            rusb::Error::Access => HiDockError::AccessDenied {
                detail: err.to_string(),
            },
            rusb::Error::Busy => HiDockError::InUseByAnother,
            other => HiDockError::ProtocolError {
                detail: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, HiDockError>;
