//! Error types for the ST bootloader.

use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq)]
pub enum Error {
    #[error("DFU status poll timed out")]
    StatusTimeout,
    #[error("DFU invalid status response of {0} bytes")]
    InvalidStatus(usize),
    #[error("Unknown chip id 0x{0:03x}")]
    UnknownChipId(u16),
    #[error("Bootloader invalid response")]
    InvalidResponse,
    #[error("Address 0x{0:08x} is not the start of a sector")]
    InvalidSector(u32),
    #[error("Invalid read length {0}, expected 1 to 256 bytes")]
    InvalidLength(usize),
    #[error("Bootloader handle closed")]
    NotConnected,
}
