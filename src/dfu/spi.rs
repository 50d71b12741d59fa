//! ST system bootloader over SPI (AN4286).
//!
//! Every command is `SYNC | cmd | !cmd`, acknowledged by the device. Arguments follow in separate
//! frames, each closed by a checksum and acknowledged. The host acknowledges every ACK it reads.
use std::time::{Duration, Instant};

use tracing::debug;

use crate::dfu::error::Error;
use crate::dfu::StBootloader;
use crate::panda::mcu::McuType;
use crate::transport::error::Error as SpiError;
use crate::transport::spi::{SpiBus, SpiLock, ACK, NACK, SYNC};
use crate::Result;

const CMD_GET_ID: u8 = 0x02;
const CMD_READ: u8 = 0x11;
const CMD_GO: u8 = 0x21;
const CMD_WRITE: u8 = 0x31;
const CMD_ERASE: u8 = 0x44;

/// Largest block a single write command accepts.
const WRITE_BLOCK_SIZE: usize = 256;
const MAX_XFER_RETRY_COUNT: usize = 5;

const HELLO_ACK_TIMEOUT: Duration = Duration::from_millis(100);
const CMD_ACK_TIMEOUT: Duration = Duration::from_millis(10);
const DATA_ACK_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// XOR of all bytes. A single byte is sent with its complement.
pub fn checksum(dat: &[u8]) -> u8 {
    match dat {
        [b] => b ^ 0xff,
        _ => dat.iter().fold(0, |acc, &x| acc ^ x),
    }
}

fn get_ack<B: SpiBus>(spi: &mut B, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let data = loop {
        let data = spi.transfer(&[0x00])?.first().copied().unwrap_or(0);
        if data == ACK || data == NACK || start.elapsed() >= timeout {
            break data;
        }
        std::thread::sleep(Duration::from_millis(1));
    };
    spi.transfer(&[ACK])?;

    match data {
        ACK => Ok(()),
        NACK => Err(SpiError::Nack.into()),
        _ => Err(SpiError::MissingAck.into()),
    }
}

/// ST bootloader reached over an SPI bus.
pub struct SpiBootloader<B: SpiBus> {
    bus: Option<B>,
    mcu_type: McuType,
}

impl<B: SpiBus> SpiBootloader<B> {
    /// Say hello and identify the chip.
    pub fn new(mut bus: B) -> Result<Self> {
        {
            let mut spi = SpiLock::acquire(&mut bus).map_err(SpiError::from)?;
            spi.transfer(&[SYNC])?;
            match get_ack(&mut *spi, HELLO_ACK_TIMEOUT) {
                // Only the first hello is acknowledged
                Ok(()) | Err(crate::Error::SpiError(SpiError::Nack | SpiError::MissingAck)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut ret = Self {
            bus: Some(bus),
            mcu_type: McuType::F4,
        };
        let chip_id = ret.get_chip_id()?;
        ret.mcu_type = McuType::from_idcode(chip_id).ok_or(Error::UnknownChipId(chip_id))?;
        Ok(ret)
    }

    fn cmd_no_retry(
        &mut self,
        cmd: u8,
        data: &[&[u8]],
        read_bytes: usize,
        predata: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let bus = self.bus.as_mut().ok_or(Error::NotConnected)?;
        let mut spi = SpiLock::acquire(bus).map_err(SpiError::from)?;

        spi.transfer(&[SYNC])?;
        spi.transfer(&[cmd, cmd ^ 0xff])?;
        get_ack(&mut *spi, CMD_ACK_TIMEOUT)?;

        // Some commands send their first argument without a checksum
        if let Some(predata) = predata {
            spi.transfer(predata)?;
            get_ack(&mut *spi, DEFAULT_ACK_TIMEOUT)?;
        }

        for d in data {
            let mut packet = d.to_vec();
            let cksum = match predata {
                Some(predata) => checksum(&[predata, d].concat()),
                None => checksum(d),
            };
            packet.push(cksum);
            spi.transfer(&packet)?;
            get_ack(&mut *spi, DATA_ACK_TIMEOUT)?;
        }

        let mut ret = vec![];
        if read_bytes > 0 {
            // First byte is a dummy
            ret = spi.read(read_bytes + 1)?.split_off(1);
            if data.is_empty() {
                get_ack(&mut *spi, DEFAULT_ACK_TIMEOUT)?;
            }
        }
        Ok(ret)
    }

    fn cmd(
        &mut self,
        cmd: u8,
        data: &[&[u8]],
        read_bytes: usize,
        predata: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let mut err = crate::Error::SpiError(SpiError::MissingAck);
        for n in 0..MAX_XFER_RETRY_COUNT {
            match self.cmd_no_retry(cmd, data, read_bytes, predata) {
                Ok(ret) => return Ok(ret),
                Err(e @ crate::Error::SpiError(_)) => {
                    debug!(
                        "SPI bootloader transfer failed, {} retries left: {}",
                        MAX_XFER_RETRY_COUNT - n - 1,
                        e
                    );
                    err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(err)
    }

    /// Read `length` bytes at `address`. A single read returns between 1 and 256 bytes.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        if !(1..=WRITE_BLOCK_SIZE).contains(&length) {
            return Err(Error::InvalidLength(length).into());
        }
        let len = [(length - 1) as u8];
        self.cmd(CMD_READ, &[&address.to_be_bytes(), &len], length, None)
    }

    pub fn get_chip_id(&mut self) -> Result<u16> {
        let r = self.cmd(CMD_GET_ID, &[], 3, None)?;
        // Response length - 1
        if r.len() != 3 || r[0] != 1 {
            return Err(Error::InvalidResponse.into());
        }
        Ok(u16::from_be_bytes([r[1], r[2]]))
    }

    pub fn go(&mut self, address: u32) -> Result<()> {
        self.cmd(CMD_GO, &[&address.to_be_bytes()], 0, None)?;
        Ok(())
    }

    /// MCU unique id, hex encoded.
    pub fn get_uid(&mut self) -> Result<String> {
        let dat = self.read(self.mcu_type.config().uid_address, 12)?;
        Ok(hex::encode(dat))
    }

    pub fn erase_sector(&mut self, sector: u16) -> Result<()> {
        // Number of sectors to erase, minus one
        let count = 0u16.to_be_bytes();
        self.cmd(CMD_ERASE, &[&sector.to_be_bytes()], 0, Some(&count))?;
        Ok(())
    }
}

impl<B: SpiBus + Send> StBootloader for SpiBootloader<B> {
    fn mcu_type(&self) -> McuType {
        self.mcu_type
    }

    fn clear_status(&mut self) -> Result<()> {
        Ok(())
    }

    fn erase(&mut self, address: u32) -> Result<()> {
        let config = self.mcu_type.config();
        let sector = (0..config.sector_count())
            .find(|&i| config.sector_address(i) == address)
            .ok_or(Error::InvalidSector(address))?;
        self.erase_sector(sector as u16)
    }

    /// `block_size` is ignored, the SPI write command takes at most 256 bytes.
    fn program(&mut self, address: u32, dat: &[u8], _block_size: usize) -> Result<()> {
        let mut dat = dat.to_vec();
        dat.resize(dat.len().div_ceil(WRITE_BLOCK_SIZE) * WRITE_BLOCK_SIZE, 0xff);

        for (i, block) in dat.chunks(WRITE_BLOCK_SIZE).enumerate() {
            let block_address = address + (i * WRITE_BLOCK_SIZE) as u32;
            let mut payload = vec![(block.len() - 1) as u8];
            payload.extend_from_slice(block);
            self.cmd(CMD_WRITE, &[&block_address.to_be_bytes(), &payload], 0, None)?;
        }
        Ok(())
    }

    fn jump(&mut self, address: u32) -> Result<()> {
        self.go(address)
    }

    fn close(&mut self) {
        if self.bus.take().is_some() {
            debug!("closed SPI bootloader");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Answers every clocked byte from a script and records what the host sent.
    struct ScriptedBus {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl SpiBus for ScriptedBus {
        fn transfer(&mut self, tx: &[u8]) -> io::Result<Vec<u8>> {
            self.tx.extend_from_slice(tx);
            Ok(tx.iter().map(|_| self.rx.pop_front().unwrap_or(0)).collect())
        }
    }

    /// Device side of the hello followed by a GET_ID for `idcode`.
    fn hello_and_chip_id(idcode: u16) -> Vec<u8> {
        let [hi, lo] = idcode.to_be_bytes();
        vec![
            0, ACK, 0, // hello: sync, ack poll, host ack
            0, 0, 0, ACK, 0, // sync, cmd, ack poll, host ack
            0, 1, hi, lo, // dummy, length - 1, chip id
            ACK, 0, // ack poll, host ack
        ]
    }

    #[test]
    fn checksum_single_byte_is_complement() {
        assert_eq!(checksum(&[0x00]), 0xff);
        assert_eq!(checksum(&[0x12, 0x34]), 0x26);
        assert_eq!(checksum(&[0x08, 0x00, 0x00, 0x00]), 0x08);
    }

    #[test]
    fn detects_mcu() {
        let bus = ScriptedBus {
            rx: hello_and_chip_id(0x483).into(),
            tx: vec![],
        };
        let dfu = SpiBootloader::new(bus).unwrap();
        assert_eq!(dfu.mcu_type(), McuType::H7);

        let tx = &dfu.bus.as_ref().unwrap().tx;
        assert_eq!(tx[0], SYNC);
        assert_eq!(&tx[3..6], &[SYNC, CMD_GET_ID, CMD_GET_ID ^ 0xff]);
    }

    #[test]
    fn unknown_chip() {
        let bus = ScriptedBus {
            rx: hello_and_chip_id(0x123).into(),
            tx: vec![],
        };
        assert_eq!(
            SpiBootloader::new(bus).err(),
            Some(crate::Error::DfuError(Error::UnknownChipId(0x123)))
        );
    }

    #[test]
    fn erase_sends_predata_and_checksum() {
        let mut rx = hello_and_chip_id(0x463);
        let start = rx.len();
        rx.extend([
            0, 0, 0, ACK, 0, // sync, cmd, ack
            0, 0, ACK, 0, // predata, ack
            0, 0, 0, ACK, 0, // sector + checksum, ack
        ]);
        let bus = ScriptedBus {
            rx: rx.into(),
            tx: vec![],
        };
        let mut dfu = SpiBootloader::new(bus).unwrap();
        dfu.erase(McuType::F4.config().app_address).unwrap();

        let tx = &dfu.bus.as_ref().unwrap().tx[start..];
        assert_eq!(&tx[..3], &[SYNC, CMD_ERASE, CMD_ERASE ^ 0xff]);
        // predata follows the host ACK of the command
        assert_eq!(&tx[5..7], &[0, 0]);
        // sector 1, checksum over predata and sector
        assert_eq!(&tx[9..12], &[0, 1, 1]);
    }

    #[test]
    fn read_length_bounds() {
        let bus = ScriptedBus {
            rx: hello_and_chip_id(0x463).into(),
            tx: vec![],
        };
        let mut dfu = SpiBootloader::new(bus).unwrap();
        let sent = dfu.bus.as_ref().unwrap().tx.len();

        for length in [0, 257] {
            assert_eq!(
                dfu.read(0x8000000, length),
                Err(crate::Error::DfuError(Error::InvalidLength(length)))
            );
        }
        // Nothing was clocked out for the rejected reads
        assert_eq!(dfu.bus.as_ref().unwrap().tx.len(), sent);
    }

    #[test]
    fn erase_last_h7_sector() {
        let mut rx = hello_and_chip_id(0x483);
        let start = rx.len();
        rx.extend([
            0, 0, 0, ACK, 0, // sync, cmd, ack
            0, 0, ACK, 0, // predata, ack
            0, 0, 0, ACK, 0, // sector + checksum, ack
        ]);
        let bus = ScriptedBus {
            rx: rx.into(),
            tx: vec![],
        };
        let mut dfu = SpiBootloader::new(bus).unwrap();
        dfu.erase(0x8000000 + 6 * 0x20000).unwrap();
        assert_eq!(&dfu.bus.as_ref().unwrap().tx[start + 9..start + 12], &[0, 6, 6]);

        // One past the last of the seven sectors
        assert_eq!(
            dfu.erase(0x8000000 + 7 * 0x20000),
            Err(crate::Error::DfuError(Error::InvalidSector(0x8000000 + 7 * 0x20000)))
        );
    }

    #[test]
    fn erase_rejects_unaligned_address() {
        let bus = ScriptedBus {
            rx: hello_and_chip_id(0x463).into(),
            tx: vec![],
        };
        let mut dfu = SpiBootloader::new(bus).unwrap();
        assert_eq!(
            dfu.erase(0x8000010),
            Err(crate::Error::DfuError(Error::InvalidSector(0x8000010)))
        );
    }
}
