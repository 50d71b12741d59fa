//! Client for the ST system bootloader, used to put a fresh bootstub on a panda.
//!
//! A panda enters the bootloader through [`crate::panda::ResetKind::EnterBootloader`]. It then
//! enumerates as an ST DFU device whose serial is derived from the MCU UID, see
//! [`PandaDfu::st_serial_to_dfu_serial`].
pub mod error;
pub mod spi;
pub mod usb;

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::panda::mcu::McuType;
use crate::transport::usb::{find_devices, UsbHandle};
use crate::Result;

use usb::{UsbBootloader, DFU_PRODUCT_ID, DFU_SERIAL_INDEX, DFU_VENDOR_ID};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Commands shared by the ST bootloader on every transport.
pub trait StBootloader: Send {
    fn mcu_type(&self) -> McuType;
    /// Bring the bootloader back to idle after an aborted operation.
    fn clear_status(&mut self) -> Result<()>;
    /// Erase the sector starting at `address`.
    fn erase(&mut self, address: u32) -> Result<()>;
    fn program(&mut self, address: u32, dat: &[u8], block_size: usize) -> Result<()>;
    /// Leave the bootloader and run the code at `address`.
    fn jump(&mut self, address: u32) -> Result<()>;
    fn close(&mut self);
}

/// Session with a panda in DFU mode.
pub struct PandaDfu {
    handle: Option<Box<dyn StBootloader>>,
    mcu_type: McuType,
}

impl PandaDfu {
    /// Open the bootloader matching `dfu_serial`, or the first one found. USB is tried before SPI.
    pub fn new(dfu_serial: Option<&str>) -> Result<PandaDfu> {
        if let Some(handle) = Self::usb_connect(dfu_serial)? {
            return Ok(Self::from_handle(handle));
        }

        #[cfg(target_os = "linux")]
        if let Some(handle) = Self::spi_connect(dfu_serial)? {
            return Ok(Self::from_handle(handle));
        }

        Err(crate::Error::NotFound)
    }

    pub fn from_handle(handle: Box<dyn StBootloader>) -> PandaDfu {
        let mcu_type = handle.mcu_type();
        PandaDfu {
            handle: Some(handle),
            mcu_type,
        }
    }

    fn usb_connect(dfu_serial: Option<&str>) -> Result<Option<Box<dyn StBootloader>>> {
        let context = rusb::Context::new()?;

        for (device, desc) in find_devices(&context, DFU_VENDOR_ID, &[DFU_PRODUCT_ID])? {
            let this_serial = match Self::usb_serial(&device) {
                Ok(s) => s,
                Err(e) => {
                    debug!("Failed to read serial of DFU device: {}", e);
                    continue;
                }
            };

            if dfu_serial.is_some_and(|s| s != this_serial) {
                continue;
            }

            debug!("opening DFU device {}", this_serial);
            return Ok(Some(Box::new(UsbBootloader::open(&device, &desc)?)));
        }

        Ok(None)
    }

    fn usb_serial(device: &rusb::Device<rusb::Context>) -> Result<String> {
        let handle = UsbHandle::open(device, false)?;
        handle.read_string_descriptor(DFU_SERIAL_INDEX)
    }

    #[cfg(target_os = "linux")]
    fn spi_connect(dfu_serial: Option<&str>) -> Result<Option<Box<dyn StBootloader>>> {
        use crate::transport::spidev::{SpidevBus, BOOTLOADER_SPEED_HZ, DEFAULT_DEVICE};

        let bus = match SpidevBus::open(DEFAULT_DEVICE, BOOTLOADER_SPEED_HZ) {
            Ok(bus) => bus,
            Err(e) => {
                debug!("Failed to open {}: {}", DEFAULT_DEVICE, e);
                return Ok(None);
            }
        };

        let mut handle = match spi::SpiBootloader::new(bus) {
            Ok(handle) => handle,
            Err(e) => {
                debug!("No ST bootloader on SPI: {}", e);
                return Ok(None);
            }
        };

        let uid = handle.get_uid()?;
        let this_serial = Self::st_serial_to_dfu_serial(&uid, handle.mcu_type());
        if dfu_serial.is_some() && dfu_serial != this_serial.as_deref() {
            return Ok(None);
        }

        Ok(Some(Box::new(handle)))
    }

    /// Serials of all bootloaders on USB and SPI.
    pub fn list() -> Result<Vec<String>> {
        let mut ret = Self::usb_list()?;
        for serial in Self::spi_list() {
            if !ret.contains(&serial) {
                ret.push(serial);
            }
        }
        Ok(ret)
    }

    pub fn usb_list() -> Result<Vec<String>> {
        let context = rusb::Context::new()?;
        let mut ret = vec![];

        for (device, _) in find_devices(&context, DFU_VENDOR_ID, &[DFU_PRODUCT_ID])? {
            match Self::usb_serial(&device) {
                Ok(serial) => ret.push(serial),
                Err(e) => debug!("Failed to read serial of DFU device: {}", e),
            }
        }

        Ok(ret)
    }

    pub fn spi_list() -> Vec<String> {
        #[cfg(target_os = "linux")]
        {
            use crate::transport::spidev::{SpidevBus, BOOTLOADER_SPEED_HZ, DEFAULT_DEVICE};

            let serial = SpidevBus::open(DEFAULT_DEVICE, BOOTLOADER_SPEED_HZ)
                .map_err(crate::Error::from)
                .and_then(spi::SpiBootloader::new)
                .and_then(|mut handle| {
                    let uid = handle.get_uid()?;
                    Ok(Self::st_serial_to_dfu_serial(&uid, handle.mcu_type()))
                });
            match serial {
                Ok(Some(serial)) => return vec![serial],
                Ok(None) => {}
                Err(e) => debug!("No ST bootloader on SPI: {}", e),
            }
        }
        vec![]
    }

    /// Serial the ST bootloader reports for the MCU with hex encoded UID `st`.
    ///
    /// The UID is read as six little endian u16 words, three sums of which are packed big endian.
    /// Returns `None` if `st` isn't 12 bytes of hex.
    pub fn st_serial_to_dfu_serial(st: &str, mcu_type: McuType) -> Option<String> {
        let raw = hex::decode(st).ok()?;
        if raw.len() != 12 {
            return None;
        }

        let uid: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();

        let offset = match mcu_type {
            McuType::F2 | McuType::F4 => 0xa,
            McuType::H7 => 0,
        };

        let words = [
            uid[1].wrapping_add(uid[5]),
            uid[0].wrapping_add(uid[4]).wrapping_add(offset),
            uid[3],
        ];
        let packed: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        Some(hex::encode_upper(packed))
    }

    /// Poll the bootloader list at 10 Hz until `dfu_serial` shows up.
    pub fn wait_for_dfu(dfu_serial: &str, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        loop {
            if Self::list()?.iter().any(|s| s == dfu_serial) {
                return Ok(true);
            }
            if start.elapsed() > timeout {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn mcu_type(&self) -> McuType {
        self.mcu_type
    }

    fn handle(&mut self) -> Result<&mut Box<dyn StBootloader>> {
        self.handle
            .as_mut()
            .ok_or(crate::Error::DfuError(error::Error::NotConnected))
    }

    /// Erase the bootstub and application sectors, then write `code` at the bootstub address.
    pub fn program_bootstub(&mut self, code: &[u8]) -> Result<()> {
        let config = self.mcu_type.config();
        let handle = self.handle()?;
        handle.clear_status()?;
        handle.erase(config.bootstub_address)?;
        handle.erase(config.app_address)?;
        handle.program(config.bootstub_address, code, config.block_size)?;
        Ok(())
    }

    /// Run the bootstub. The bootloader disappears from the bus.
    pub fn reset(&mut self) -> Result<()> {
        let address = self.mcu_type.config().bootstub_address;
        self.handle()?.jump(address)
    }

    /// Program the bootstub built into `firmware_dir` and start it.
    pub fn recover(&mut self, firmware_dir: &Path) -> Result<()> {
        let path = self.mcu_type.config().bootstub_path(firmware_dir);
        info!("recover: flashing {}", path.display());
        let code = std::fs::read(&path)?;

        self.program_bootstub(&code)?;
        self.reset()
    }

    /// Release the bootloader. Calling it twice is a no-op.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }
}

impl Drop for PandaDfu {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn dfu_serial_h7() {
        assert_eq!(
            PandaDfu::st_serial_to_dfu_serial("000102030405060708090a0b", McuType::H7).unwrap(),
            "0E0C0A080706"
        );
    }

    #[test]
    fn dfu_serial_f4_offset() {
        assert_eq!(
            PandaDfu::st_serial_to_dfu_serial("000102030405060708090a0b", McuType::F4).unwrap(),
            "0E0C0A120706"
        );
    }

    #[test]
    fn dfu_serial_wraps() {
        assert_eq!(
            PandaDfu::st_serial_to_dfu_serial("00000000000000000000ffff", McuType::H7).unwrap(),
            "FFFF00000000"
        );
    }

    #[test]
    fn dfu_serial_invalid() {
        assert_eq!(PandaDfu::st_serial_to_dfu_serial("xyz", McuType::H7), None);
        assert_eq!(PandaDfu::st_serial_to_dfu_serial("0001", McuType::H7), None);
    }

    #[derive(Debug, PartialEq)]
    enum Op {
        ClearStatus,
        Erase(u32),
        Program(u32, usize, usize),
        Jump(u32),
        Close,
    }

    struct FakeBootloader(Arc<Mutex<Vec<Op>>>);

    impl StBootloader for FakeBootloader {
        fn mcu_type(&self) -> McuType {
            McuType::H7
        }
        fn clear_status(&mut self) -> Result<()> {
            self.0.lock().unwrap().push(Op::ClearStatus);
            Ok(())
        }
        fn erase(&mut self, address: u32) -> Result<()> {
            self.0.lock().unwrap().push(Op::Erase(address));
            Ok(())
        }
        fn program(&mut self, address: u32, dat: &[u8], block_size: usize) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push(Op::Program(address, dat.len(), block_size));
            Ok(())
        }
        fn jump(&mut self, address: u32) -> Result<()> {
            self.0.lock().unwrap().push(Op::Jump(address));
            Ok(())
        }
        fn close(&mut self) {
            self.0.lock().unwrap().push(Op::Close);
        }
    }

    #[test]
    fn bootstub_sequence() {
        let ops = Arc::new(Mutex::new(vec![]));
        let mut dfu = PandaDfu::from_handle(Box::new(FakeBootloader(ops.clone())));

        dfu.program_bootstub(&[0; 100]).unwrap();
        dfu.reset().unwrap();
        dfu.close();
        dfu.close();

        assert_eq!(
            *ops.lock().unwrap(),
            vec![
                Op::ClearStatus,
                Op::Erase(0x8000000),
                Op::Erase(0x8020000),
                Op::Program(0x8000000, 100, 0x400),
                Op::Jump(0x8000000),
                Op::Close,
            ]
        );
    }

    #[test]
    fn closed_session() {
        let ops = Arc::new(Mutex::new(vec![]));
        let mut dfu = PandaDfu::from_handle(Box::new(FakeBootloader(ops)));
        dfu.close();
        assert_eq!(
            dfu.reset(),
            Err(crate::Error::DfuError(error::Error::NotConnected))
        );
    }
}
