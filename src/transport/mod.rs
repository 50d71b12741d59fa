//! Transports carrying the panda's vendor request model.
//!
//! Both backends expose the same four transfer primitives. A [`crate::panda::Panda`] owns exactly one
//! boxed [`Transport`] at a time and never cares which backend sits behind it.

pub mod error;
pub mod spi;
#[cfg(target_os = "linux")]
pub mod spidev;
pub mod usb;

use std::time::Duration;

use crate::Result;

/// bmRequestType for vendor requests to the device, host to device.
pub const REQUEST_OUT: u8 = 0x40;
/// bmRequestType for vendor requests to the device, device to host.
pub const REQUEST_IN: u8 = 0xc0;

/// Largest control transfer data stage the firmware handles.
pub const USBPACKET_MAX_SIZE: usize = 0x40;

/// Default timeout for a single transfer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(15_000);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportKind {
    Usb,
    Spi,
}

/// Uniform control/bulk surface implemented by the USB and SPI backends.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Control transfer from host to device. Returns the number of data bytes written.
    fn control_write(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Control transfer from device to host, reading up to `length` bytes.
    fn control_read(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>>;

    /// Bulk OUT transfer. May write fewer bytes than requested, the caller re-submits the tail.
    fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Bulk IN transfer of up to `length` bytes.
    fn bulk_read(&mut self, endpoint: u8, length: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Control write that makes the device reset. Backends that can tell don't wait for a reply.
    fn control_write_reset(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<()> {
        self.control_write(request_type, request, value, index, &[], timeout)?;
        Ok(())
    }

    /// Release the underlying OS handle. Calling it twice is a no-op.
    fn close(&mut self);
}
