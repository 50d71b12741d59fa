//! ST DfuSe bootloader over USB.
use std::time::{Duration, Instant};

use rusb::{Context, Device, DeviceDescriptor};
use strum_macros::FromRepr;
use tracing::debug;

use crate::dfu::error::Error;
use crate::dfu::StBootloader;
use crate::panda::mcu::McuType;
use crate::transport::usb::{bcd_device, UsbHandle};
use crate::transport::{Transport, DEFAULT_TIMEOUT};
use crate::Result;

pub const DFU_VENDOR_ID: u16 = 0x0483;
pub const DFU_PRODUCT_ID: u16 = 0xdf11;

/// String descriptor index holding the serial derived from the MCU UID.
pub const DFU_SERIAL_INDEX: u8 = 3;

const DFU_DNLOAD: u8 = 1;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

/// Class request to the interface, host to device and device to host.
const DFU_REQUEST_OUT: u8 = 0x21;
const DFU_REQUEST_IN: u8 = 0xa1;

const CMD_SET_ADDRESS: u8 = 0x21;
const CMD_ERASE: u8 = 0x41;

const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

/// bcdDevice of the H7 system bootloader.
const BCD_DEVICE_H7: u16 = 0x0200;

#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DnloadSync = 3,
    DnBusy = 4,
    DnloadIdle = 5,
    ManifestSync = 6,
    Manifest = 7,
    ManifestWaitReset = 8,
    UploadIdle = 9,
    Error = 10,
}

/// DFU commands on top of any transport that can do control transfers.
pub struct UsbBootloader<T: Transport> {
    handle: T,
    mcu_type: McuType,
}

impl UsbBootloader<UsbHandle> {
    /// Open and claim a bootloader found during enumeration. The MCU is told apart by bcdDevice.
    pub fn open(device: &Device<Context>, desc: &DeviceDescriptor) -> Result<Self> {
        let handle = UsbHandle::open(device, true)?;
        let mcu_type = match bcd_device(desc) {
            BCD_DEVICE_H7 => McuType::H7,
            _ => McuType::F4,
        };
        Ok(Self::new(handle, mcu_type))
    }
}

impl<T: Transport> UsbBootloader<T> {
    pub fn new(handle: T, mcu_type: McuType) -> Self {
        Self { handle, mcu_type }
    }

    fn get_status(&mut self) -> Result<Vec<u8>> {
        let dat = self.handle.control_read(
            DFU_REQUEST_IN,
            DFU_GETSTATUS,
            0,
            0,
            6,
            DEFAULT_TIMEOUT,
        )?;
        if dat.len() != 6 {
            return Err(Error::InvalidStatus(dat.len()).into());
        }
        Ok(dat)
    }

    /// Poll the status until the device reports no pending poll timeout.
    fn status(&mut self) -> Result<()> {
        let start = Instant::now();
        loop {
            let dat = self.get_status()?;
            if dat[1] == 0 {
                return Ok(());
            }
            if start.elapsed() > STATUS_TIMEOUT {
                return Err(Error::StatusTimeout.into());
            }
        }
    }

    fn dnload(&mut self, value: u16, data: &[u8]) -> Result<()> {
        self.handle
            .control_write(DFU_REQUEST_OUT, DFU_DNLOAD, value, 0, data, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    fn set_address(&mut self, address: u32) -> Result<()> {
        let mut cmd = vec![CMD_SET_ADDRESS];
        cmd.extend(address.to_le_bytes());
        self.dnload(0, &cmd)?;
        self.status()
    }
}

impl<T: Transport> StBootloader for UsbBootloader<T> {
    fn mcu_type(&self) -> McuType {
        self.mcu_type
    }

    fn clear_status(&mut self) -> Result<()> {
        let stat = self.get_status()?;
        match DfuState::from_repr(stat[4]) {
            Some(DfuState::Error) => {
                self.handle.control_write(
                    DFU_REQUEST_OUT,
                    DFU_CLRSTATUS,
                    0,
                    0,
                    &[],
                    DEFAULT_TIMEOUT,
                )?;
            }
            Some(DfuState::DnBusy | DfuState::DnloadIdle | DfuState::UploadIdle) => {
                self.handle
                    .control_write(DFU_REQUEST_OUT, DFU_ABORT, 0, 0, &[], DEFAULT_TIMEOUT)?;
                self.status()?;
            }
            _ => {}
        }

        let stat = self.get_status()?;
        debug!("DFU status after clear: {:?}", DfuState::from_repr(stat[4]));
        Ok(())
    }

    fn erase(&mut self, address: u32) -> Result<()> {
        let mut cmd = vec![CMD_ERASE];
        cmd.extend(address.to_le_bytes());
        self.dnload(0, &cmd)?;
        self.status()
    }

    fn program(&mut self, address: u32, dat: &[u8], block_size: usize) -> Result<()> {
        self.set_address(address)?;

        let bs = block_size.min(dat.len()).max(1);
        let mut dat = dat.to_vec();
        dat.resize(dat.len().div_ceil(bs) * bs, 0xff);

        for (i, block) in dat.chunks(bs).enumerate() {
            debug!("programming {} with length {}", i, block.len());
            self.dnload(2 + i as u16, block)?;
            self.status()?;
        }
        Ok(())
    }

    fn jump(&mut self, address: u32) -> Result<()> {
        self.set_address(address)?;

        // The device leaves DFU mode during the status request
        if let Err(e) = self.dnload(2, &[]).and_then(|_| self.get_status()) {
            debug!("DFU jump: expected disconnect: {}", e);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;
    use std::collections::VecDeque;

    /// Records control writes and answers status requests from a queue of states.
    struct ScriptedDfu {
        writes: Vec<(u8, u16, Vec<u8>)>,
        states: VecDeque<u8>,
    }

    impl Transport for ScriptedDfu {
        fn kind(&self) -> TransportKind {
            TransportKind::Usb
        }

        fn control_write(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            _index: u16,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<usize> {
            assert_eq!(request_type, DFU_REQUEST_OUT);
            self.writes.push((request, value, data.to_vec()));
            Ok(data.len())
        }

        fn control_read(
            &mut self,
            request_type: u8,
            request: u8,
            _value: u16,
            _index: u16,
            length: u16,
            _timeout: Duration,
        ) -> Result<Vec<u8>> {
            assert_eq!(request_type, DFU_REQUEST_IN);
            assert_eq!(request, DFU_GETSTATUS);
            assert_eq!(length, 6);
            let state = self.states.pop_front().unwrap_or(DfuState::DfuIdle as u8);
            Ok(vec![0, 0, 0, 0, state, 0])
        }

        fn bulk_write(&mut self, _: u8, _: &[u8], _: Duration) -> Result<usize> {
            unreachable!()
        }

        fn bulk_read(&mut self, _: u8, _: usize, _: Duration) -> Result<Vec<u8>> {
            unreachable!()
        }

        fn close(&mut self) {}
    }

    fn bootloader(states: &[u8]) -> UsbBootloader<ScriptedDfu> {
        let handle = ScriptedDfu {
            writes: vec![],
            states: states.iter().copied().collect(),
        };
        UsbBootloader::new(handle, McuType::H7)
    }

    #[test]
    fn erase_sets_page_address() {
        let mut dfu = bootloader(&[]);
        dfu.erase(0x8020000).unwrap();
        assert_eq!(
            dfu.handle.writes,
            vec![(DFU_DNLOAD, 0, vec![0x41, 0x00, 0x00, 0x02, 0x08])]
        );
    }

    #[test]
    fn program_pads_last_block() {
        let mut dfu = bootloader(&[]);
        dfu.program(0x8000000, &[1, 2, 3, 4, 5], 4).unwrap();

        let writes = &dfu.handle.writes;
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0], (DFU_DNLOAD, 0, vec![0x21, 0x00, 0x00, 0x00, 0x08]));
        assert_eq!(writes[1], (DFU_DNLOAD, 2, vec![1, 2, 3, 4]));
        assert_eq!(writes[2], (DFU_DNLOAD, 3, vec![5, 0xff, 0xff, 0xff]));
    }

    #[test]
    fn clear_status_from_error() {
        let mut dfu = bootloader(&[DfuState::Error as u8]);
        dfu.clear_status().unwrap();
        assert_eq!(dfu.handle.writes, vec![(DFU_CLRSTATUS, 0, vec![])]);
    }

    #[test]
    fn clear_status_aborts_download() {
        let mut dfu = bootloader(&[DfuState::DnloadIdle as u8]);
        dfu.clear_status().unwrap();
        assert_eq!(dfu.handle.writes, vec![(DFU_ABORT, 0, vec![])]);
    }

    #[test]
    fn jump_issues_empty_download() {
        let mut dfu = bootloader(&[]);
        dfu.jump(0x8000000).unwrap();
        assert_eq!(dfu.handle.writes.len(), 2);
        assert_eq!(dfu.handle.writes[1], (DFU_DNLOAD, 2, vec![]));
    }
}
