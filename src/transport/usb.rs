//! libusb backend, using [`rusb`].
use std::time::Duration;

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};
use tracing::debug;

use crate::error::Error;
use crate::transport::{Transport, TransportKind};
use crate::Result;

/// Claimed USB device handle. The libusb context lives as long as the handle does.
pub struct UsbHandle {
    handle: Option<DeviceHandle<Context>>,
}

/// Raw bcdDevice value. rusb decodes it into a [`rusb::Version`], this packs it back.
pub fn bcd_device(desc: &DeviceDescriptor) -> u16 {
    let version = desc.device_version();
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16) << 4)
        | (version.sub_minor() as u16)
}

/// Walk the device tree of a fresh context and return every device matching the vendor and one of the products.
pub fn find_devices(
    context: &Context,
    vendor_id: u16,
    product_ids: &[u16],
) -> Result<Vec<(Device<Context>, DeviceDescriptor)>> {
    let mut ret = vec![];
    for device in context.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };

        if desc.vendor_id() != vendor_id || !product_ids.contains(&desc.product_id()) {
            continue;
        }

        ret.push((device, desc));
    }
    Ok(ret)
}

/// Read the iSerialNumber string of a device, which requires opening it.
pub fn read_serial(device: &Device<Context>, desc: &DeviceDescriptor) -> Result<String> {
    let handle = device.open()?;
    Ok(handle.read_serial_number_string_ascii(desc)?)
}

impl UsbHandle {
    /// Open a device. When `claim` is set, kernel drivers are detached and interface 0 is claimed.
    pub fn open(device: &Device<Context>, claim: bool) -> Result<UsbHandle> {
        let mut handle = device.open()?;

        if claim {
            #[cfg(target_os = "linux")]
            handle.set_auto_detach_kernel_driver(true)?;
            handle.claim_interface(0)?;
        }

        Ok(UsbHandle {
            handle: Some(handle),
        })
    }

    /// Read a string descriptor by index, e.g. the serial of an ST bootloader.
    pub fn read_string_descriptor(&self, index: u8) -> Result<String> {
        Ok(self.handle()?.read_string_descriptor_ascii(index)?)
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>> {
        self.handle
            .as_ref()
            .ok_or(Error::PandaError(crate::panda::error::Error::NotConnected))
    }
}

impl Transport for UsbHandle {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn control_write(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self
            .handle()?
            .write_control(request_type, request, value, index, data, timeout)?)
    }

    fn control_read(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0; length as usize];
        let n = self
            .handle()?
            .read_control(request_type, request, value, index, &mut buf, timeout)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle()?.write_bulk(endpoint & 0x7f, data, timeout)?)
    }

    fn bulk_read(&mut self, endpoint: u8, length: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0; length];
        let n = self.handle()?.read_bulk(endpoint | 0x80, &mut buf, timeout)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn close(&mut self) {
        if self.handle.take().is_some() {
            debug!("closed USB handle");
        }
    }
}
