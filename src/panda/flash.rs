//! Flashing the application through the bootstub, and recovering a broken bootstub through DFU.
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dfu::PandaDfu;
use crate::panda::constants::{BootstubEndpoint, BulkEndpoint, Endpoint};
use crate::panda::mcu::McuType;
use crate::panda::{flasher_present, Panda, ResetKind};
use crate::transport::{Transport, DEFAULT_TIMEOUT, REQUEST_OUT};
use crate::Result;

/// Size of the bulk writes the flasher accepts.
const FLASH_STEP: usize = 0x10;
/// The signature is appended to the signed application image.
pub const SIGNATURE_SIZE: usize = 128;

/// Signature of an application image, its last 128 bytes.
pub fn signature_from_firmware(code: &[u8]) -> &[u8] {
    &code[code.len().saturating_sub(SIGNATURE_SIZE)..]
}

impl Panda {
    /// Write `code` to the application sectors using the bootstub flasher on `handle`, then reset the device.
    pub fn flash_static(handle: &mut dyn Transport, code: &[u8], mcu_type: McuType) -> Result<()> {
        if !flasher_present(handle) {
            return Err(crate::panda::error::Error::FlasherMissing.into());
        }

        let last_sector = mcu_type.config().last_sector(code.len())?;

        warn!("flash: unlocking");
        handle.control_write(
            REQUEST_OUT,
            BootstubEndpoint::Unlock as u8,
            0,
            0,
            &[],
            DEFAULT_TIMEOUT,
        )?;

        warn!("flash: erasing");
        for i in 1..=last_sector {
            handle.control_write(
                REQUEST_OUT,
                BootstubEndpoint::EraseSector as u8,
                i as u16,
                0,
                &[],
                DEFAULT_TIMEOUT,
            )?;
        }

        warn!("flash: flashing");
        for chunk in code.chunks(FLASH_STEP) {
            let mut tx = chunk;
            while !tx.is_empty() {
                let n = handle.bulk_write(BulkEndpoint::Serial as u8, tx, DEFAULT_TIMEOUT)?;
                tx = &tx[n.min(tx.len())..];
            }
        }

        warn!("flash: resetting");
        match handle.control_write_reset(
            REQUEST_OUT,
            Endpoint::ResetDevice as u8,
            0,
            0,
            DEFAULT_TIMEOUT,
        ) {
            Ok(()) => Ok(()),
            Err(e) if e.is_disconnect() => {
                debug!("flash: expected disconnect: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Application image for this panda, `fw` if given.
    pub fn firmware_path(&self, fw: Option<&Path>) -> Result<PathBuf> {
        match fw {
            Some(fw) => Ok(fw.to_path_buf()),
            None => Ok(self
                .get_mcu_type()?
                .config()
                .app_path(&self.config.firmware_dir)),
        }
    }

    /// Whether the running application carries the signature of the image at `fw`.
    pub fn up_to_date(&mut self, fw: Option<&Path>) -> Result<bool> {
        let code = std::fs::read(self.firmware_path(fw)?)?;
        Ok(self.get_signature()? == signature_from_firmware(&code))
    }

    /// Flash the application image at `fw`, or the built image for this MCU.
    pub fn flash(&mut self, fw: Option<&Path>, reconnect: bool) -> Result<()> {
        let path = self.firmware_path(fw)?;
        info!("flash: {}", path.display());
        let code = std::fs::read(&path)?;
        self.flash_code(&code, reconnect)
    }

    /// Flash `code` unless the device already runs it. Switches to the bootstub first if needed.
    pub fn flash_code(&mut self, code: &[u8], reconnect: bool) -> Result<()> {
        if !self.bootstub {
            if self.get_signature()? == signature_from_firmware(code) {
                info!("flash: already up to date");
                return Ok(());
            }

            debug!("flash: main version is {}", self.get_version()?);
            self.reset(ResetKind::EnterBootstub, true)?;
        }

        if !self.bootstub {
            return Err(crate::panda::error::Error::NotInBootstub.into());
        }

        match self.get_version() {
            Ok(version) => debug!("flash: bootstub version is {}", version),
            Err(e) => debug!("flash: failed to read bootstub version: {}", e),
        }

        let mcu_type = self.get_mcu_type()?;
        Self::flash_static(&mut **self.handle()?, code, mcu_type)?;

        // The device reset, the old handle is gone
        self.close();
        if reconnect {
            self.reconnect()?;
        }
        Ok(())
    }

    /// Reflash the bootstub through the ST bootloader, then the application. Returns `false` if the
    /// device didn't show up in DFU mode within `timeout`.
    pub fn recover(&mut self, timeout: Duration, reset: bool) -> Result<bool> {
        let dfu_serial = self.get_dfu_serial()?;

        if reset {
            self.reset(ResetKind::EnterBootstub, true)?;
            self.reset(ResetKind::EnterBootloader, false)?;
        }

        if !PandaDfu::wait_for_dfu(&dfu_serial, timeout)? {
            warn!("recover: {} did not enter DFU mode", dfu_serial);
            return Ok(false);
        }

        let mut dfu = PandaDfu::new(Some(&dfu_serial))?;
        dfu.recover(&self.config.firmware_dir)?;
        dfu.close();

        // Reflash the application through the fresh bootstub
        self.connect_with(true)?;
        self.flash(None, true)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_image_tail() {
        let code: Vec<u8> = (0..=255).collect();
        assert_eq!(signature_from_firmware(&code), &code[128..]);
        assert_eq!(signature_from_firmware(&code[..10]), &code[..10]);
    }
}
