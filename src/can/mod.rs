//! Generic CAN types and traits

pub mod adapter;
pub mod async_can;

use std::collections::VecDeque;
use std::fmt;

pub use adapter::get_adapter;
pub use async_can::AsyncCanAdapter;

pub static DLC_TO_LEN: &[usize] = &[0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Added to the bus number of a received frame that is the echo of a transmitted one.
pub const RETURNED_BUS_OFFSET: u16 = 128;
/// Added to the bus number of a transmitted frame that was rejected by the safety model.
pub const REJECTED_BUS_OFFSET: u16 = 192;

/// Tuple form of a frame as exchanged with firmware tooling: `(address, reserved, data, bus)`.
/// The bus carries the returned/rejected offsets.
pub type CanRecord = (u32, u32, Vec<u8>, u16);

/// Identifier for a CAN frame
#[derive(Copy, Clone, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Identifier {
    Standard(u32),
    Extended(u32),
}

impl Identifier {
    pub fn is_standard(&self) -> bool {
        match self {
            Identifier::Standard(_) => true,
            Identifier::Extended(_) => false,
        }
    }
    pub fn is_extended(&self) -> bool {
        !self.is_standard()
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Extended(id) => write!(f, "0x{:08x}", id),
            Identifier::Standard(id) => write!(f, "0x{:03x}", id),
        }
    }
}

impl From<u32> for Identifier {
    fn from(id: u32) -> Identifier {
        if id <= 0x7ff {
            Identifier::Standard(id)
        } else {
            Identifier::Extended(id)
        }
    }
}

impl From<Identifier> for u32 {
    fn from(val: Identifier) -> u32 {
        match val {
            Identifier::Standard(id) => id,
            Identifier::Extended(id) => id,
        }
    }
}

/// A CAN frame
#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// The physical bus index, 0..=7
    pub bus: u8,
    /// Arbitration ID
    pub id: Identifier,
    /// Frame Data
    pub data: Vec<u8>,
    /// Wheter the frame was sent out by the adapter
    pub loopback: bool,
    /// Frame was sent by us but blocked by the safety model
    pub rejected: bool,
    /// CAN-FD Frame
    pub fd: bool,
}
impl Unpin for Frame {}

impl Frame {
    pub fn new(bus: u8, id: Identifier, data: &[u8]) -> Result<Frame, crate::error::Error> {
        // Check if the data length is valid
        if !DLC_TO_LEN.contains(&data.len()) {
            return Err(crate::error::Error::MalformedFrame);
        }

        // Check if the ID makes sense
        match id {
            Identifier::Standard(id) if id > 0x7ff => return Err(crate::error::Error::MalformedFrame),
            Identifier::Extended(id) if id > 0x1fffffff => return Err(crate::error::Error::MalformedFrame),
            _ => {}
        };

        Ok(Frame {
            bus,
            id,
            data: data.to_vec(),
            loopback: false,
            rejected: false,
            fd: data.len() > 8,
        })
    }

    /// Bus number with the returned (+128) and rejected (+192) offsets applied.
    pub fn record_bus(&self) -> u16 {
        let mut bus = self.bus as u16;
        if self.loopback {
            bus += RETURNED_BUS_OFFSET;
        }
        if self.rejected {
            bus += REJECTED_BUS_OFFSET;
        }
        bus
    }

    pub fn to_record(&self) -> CanRecord {
        (self.id.into(), 0, self.data.clone(), self.record_bus())
    }

    /// Build a frame to transmit from its tuple form. The bus must be a physical bus.
    pub fn from_record(record: &CanRecord) -> Result<Frame, crate::error::Error> {
        let (address, _, data, bus) = record;
        let bus = u8::try_from(*bus).map_err(|_| crate::error::Error::MalformedFrame)?;
        Frame::new(bus, (*address).into(), data)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("bus", &self.bus)
            .field("id", &self.id)
            .field("data", &hex::encode(&self.data))
            .field("loopback", &self.loopback)
            .field("rejected", &self.rejected)
            .field("fd", &self.fd)
            .finish()
    }
}

/// Trait for a Blocking CAN Adapter
pub trait CanAdapter {
    /// Send frames. Frames handed over to the adapter are popped from the queue, the rest is retried by the caller.
    fn send(&mut self, frames: &mut VecDeque<Frame>) -> Result<(), crate::error::Error>;
    fn recv(&mut self) -> Result<Vec<Frame>, crate::error::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_compare() {
        assert_eq!(true, Identifier::Standard(0x123) < Identifier::Standard(0x124));
        assert_eq!(true, Identifier::Standard(0x7ff) > Identifier::Standard(0x100));

        // Extended IDs always have lower priority than standard IDs
        assert_eq!(true, Identifier::Extended(0x1) > Identifier::Standard(0x100));
    }

    #[test]
    fn record_bus_offsets() {
        let mut frame = Frame::new(2, 0x123.into(), &[1, 2]).unwrap();
        assert_eq!(frame.record_bus(), 2);

        frame.loopback = true;
        assert_eq!(frame.record_bus(), 130);

        frame.loopback = false;
        frame.rejected = true;
        assert_eq!(frame.record_bus(), 194);
    }

    #[test]
    fn record_conversion() {
        let frame = Frame::from_record(&(0x18db33f1, 0, vec![2, 0x10, 3], 1)).unwrap();
        assert_eq!(frame.id, Identifier::Extended(0x18db33f1));
        assert_eq!(frame.to_record(), (0x18db33f1, 0, vec![2, 0x10, 3], 1));

        assert_eq!(
            Frame::from_record(&(0x7df, 0, vec![0; 9], 0)),
            Err(crate::error::Error::MalformedFrame)
        );
    }
}
