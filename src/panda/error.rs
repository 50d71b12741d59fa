//! Error types for the Panda

use std::fmt;

/// Packet formats whose layout is shared between firmware and library.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketKind {
    Health,
    Can,
    CanHealth,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketKind::Health => write!(fmt, "Health"),
            PacketKind::Can => write!(fmt, "CAN"),
            PacketKind::CanHealth => write!(fmt, "CAN Health"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// CAN Packet has invalid checksum in the header
    InvalidChecksum,
    /// Panda firmware packet version doesn't match the library
    PacketVersionMismatch {
        kind: PacketKind,
        firmware: u8,
        library: u8,
    },
    /// SPI protocol version reported by the panda doesn't match the library
    SpiProtocolMismatch { expected: u8, got: u8 },
    /// Unexpected hardware type
    UnknownHwType(u8),
    /// Device serial payload failed its SHA-1 check
    HashMismatch,
    /// Image doesn't fit in the programmable sectors
    FlashGeometry { len: usize },
    /// Bootstub flasher sentinel not found
    FlasherMissing,
    /// Device is expected to run the bootstub, but runs the application
    NotInBootstub,
    /// Device is expected to run the application, but runs the bootstub
    InBootstub,
    /// Device did not come back after a reset
    ReconnectFailed,
    /// Session handle was already closed
    NotConnected,
    /// Control read returned fewer bytes than the record needs
    InvalidResponse { expected: usize, got: usize },
    /// K-Line echo didn't match the sent bytes
    KLineEcho,
    /// K-Line wakeup requested on neither line
    NoKLineSelected,
    /// CAN bit rate doesn't fit the request, in kbps
    CanSpeedOutOfRange(u16),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidChecksum => write!(fmt, "CAN packet checksum incorrect"),
            Error::PacketVersionMismatch {
                kind,
                firmware,
                library,
            } => write!(
                fmt,
                "{} packet version mismatch: panda's firmware v{}, library v{}. Reflash panda.",
                kind, firmware, library
            ),
            Error::SpiProtocolMismatch { expected, got } => write!(
                fmt,
                "panda protocol mismatch: expected {}, got {}. Reflash panda.",
                expected, got
            ),
            Error::UnknownHwType(hw_type) => write!(fmt, "Unknown HW type: 0x{:02x}", hw_type),
            Error::HashMismatch => write!(fmt, "Panda serial hash mismatch"),
            Error::FlashGeometry { len } => write!(
                fmt,
                "Binary of {} bytes doesn't fit, risk of overwriting provisioning chunk",
                len
            ),
            Error::FlasherMissing => write!(fmt, "Flasher not present"),
            Error::NotInBootstub => write!(fmt, "Panda not in bootstub"),
            Error::InBootstub => write!(fmt, "Panda is in bootstub"),
            Error::ReconnectFailed => write!(fmt, "Reconnect failed"),
            Error::NotConnected => write!(fmt, "Panda not connected"),
            Error::InvalidResponse { expected, got } => write!(
                fmt,
                "Invalid response length, expected {} got {}",
                expected, got
            ),
            Error::KLineEcho => write!(fmt, "K-Line echo mismatch"),
            Error::NoKLineSelected => write!(fmt, "Neither K nor L line selected"),
            Error::CanSpeedOutOfRange(speed) => write!(fmt, "CAN speed of {} kbps out of range", speed),
        }
    }
}

impl std::error::Error for Error {}
