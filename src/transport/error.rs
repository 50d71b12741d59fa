//! Error types for the SPI transports.

use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq)]
pub enum Error {
    #[error("SPI NACK")]
    Nack,
    #[error("SPI Missing ACK")]
    MissingAck,
    #[error("SPI Bad Checksum")]
    BadChecksum,
    #[error("SPI response length {got} greater than max {max}")]
    ResponseTooLong { got: usize, max: usize },
    #[error("SPI invalid response")]
    InvalidResponse,
    #[error("SPI I/O error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e.kind())
    }
}
