//! Linux spidev implementation of [`SpiBus`].
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

use crate::transport::spi::SpiBus;

pub const DEFAULT_DEVICE: &str = "/dev/spidev0.0";
pub const PANDA_SPEED_HZ: u32 = 30_000_000;
pub const BOOTLOADER_SPEED_HZ: u32 = 1_000_000;

/// spidev character device. The device lock is an exclusive `flock` on the file.
pub struct SpidevBus {
    dev: Spidev,
}

impl SpidevBus {
    pub fn open(path: impl AsRef<Path>, speed_hz: u32) -> io::Result<Self> {
        let mut dev = Spidev::open(path)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        dev.configure(&options)?;
        Ok(Self { dev })
    }

    fn flock(&self, operation: libc::c_int) -> io::Result<()> {
        let ret = unsafe { libc::flock(self.dev.as_raw_fd(), operation) };
        match ret {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

impl SpiBus for SpidevBus {
    fn transfer(&mut self, tx: &[u8]) -> io::Result<Vec<u8>> {
        let mut rx = vec![0; tx.len()];
        if tx.is_empty() {
            return Ok(rx);
        }
        {
            let mut transfer = SpidevTransfer::read_write(tx, &mut rx);
            self.dev.transfer(&mut transfer)?;
        }
        Ok(rx)
    }

    fn lock(&mut self) -> io::Result<()> {
        self.flock(libc::LOCK_EX)
    }

    fn unlock(&mut self) -> io::Result<()> {
        self.flock(libc::LOCK_UN)
    }
}
