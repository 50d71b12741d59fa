//! Contains the main error type for the library.
use thiserror::Error;

/// The main error type for the library. Each module has it's own error type that is contained by this error.
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("Not Found")]
    NotFound,
    #[error("Malformed Frame")]
    MalformedFrame,
    #[error("Timeout")]
    Timeout,
    #[error("Disconnected")]
    Disconnected,
    #[error("I/O error: {0:?}")]
    Io(std::io::ErrorKind),
    #[error(transparent)]
    LibUsbError(#[from] rusb::Error),
    #[error(transparent)]
    PandaError(crate::panda::error::Error),
    #[error(transparent)]
    SpiError(crate::transport::error::Error),
    #[error(transparent)]
    DfuError(crate::dfu::error::Error),
}

impl Error {
    /// Errors a transfer is expected to fail with when the device resets in the middle of it.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::LibUsbError(
                    rusb::Error::NoDevice
                        | rusb::Error::Io
                        | rusb::Error::Pipe
                        | rusb::Error::Timeout
                        | rusb::Error::NotFound
                        | rusb::Error::Other
                )
                | Error::SpiError(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound,
            std::io::ErrorKind::TimedOut => Error::Timeout,
            kind => Error::Io(kind),
        }
    }
}

impl From<crate::panda::error::Error> for Error {
    fn from(e: crate::panda::error::Error) -> Error {
        Error::PandaError(e)
    }
}

impl From<crate::transport::error::Error> for Error {
    fn from(e: crate::transport::error::Error) -> Error {
        Error::SpiError(e)
    }
}

impl From<crate::dfu::error::Error> for Error {
    fn from(e: crate::dfu::error::Error) -> Error {
        Error::DfuError(e)
    }
}

impl From<tokio_stream::Elapsed> for Error {
    fn from(_: tokio_stream::Elapsed) -> Error {
        Error::Timeout
    }
}
