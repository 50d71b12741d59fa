//! Panda device session. Owns one transport and implements the request set of the firmware on top of it.
//!
//! ## Example
//! ```rust,no_run
//! fn panda_example() -> panda::Result<()> {
//!     let mut panda = panda::panda::Panda::new()?;
//!     panda.set_safety_mode(panda::panda::SafetyModel::Silent, 0)?;
//!     let health = panda.health()?;
//!     println!("{} mV, uptime {} s", health.voltage, health.uptime);
//!     Ok(())
//! }
//! ```
pub mod config;
pub mod constants;
pub mod error;
pub mod flash;
pub mod health;
pub mod mcu;
pub mod serial;
pub mod usb_protocol;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bstr::ByteSlice;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};

use crate::can::{AsyncCanAdapter, CanAdapter, Frame};
use crate::dfu::PandaDfu;
use crate::error::Error;
use crate::panda::error::PacketKind;
use crate::panda::usb_protocol::{pack_can_buffer, unpack_can_buffer};
use crate::transport::usb::{bcd_device, find_devices, read_serial, UsbHandle};
use crate::transport::spi::{SpiBus, SpiHandle, PROTOCOL_VERSION};
use crate::transport::{Transport, TransportKind, REQUEST_IN, REQUEST_OUT};
use crate::Result;

pub use config::PandaConfig;
pub use constants::{HarnessStatus, HwType, SafetyModel, SerialPort};
pub use health::{CanHealth, Health};
pub use mcu::{McuConfig, McuType};

use constants::{
    BootstubEndpoint, BulkEndpoint, Endpoint, ResetMode, BCD_DEVICE_NO_HW_TYPE,
    CAN_HEALTH_PACKET_VERSION, CAN_PACKET_VERSION, FLASHER_SIGNATURE, HEALTH_PACKET_VERSION,
    MISSING_HW_TYPE_SIGNATURE, PRODUCT_IDS, VENDOR_ID,
};

/// Default timeout for [`Panda::can_send_many`].
pub const CAN_SEND_TIMEOUT: Duration = Duration::from_millis(10);
const CAN_RECV_SIZE: usize = 16384;
/// Bulk IN timeout of the adapter loop. A read that times out midway drops what it already received.
const CAN_RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const USB_RESET_TIMEOUT: Duration = Duration::from_millis(15_000);
const SPI_RESET_TIMEOUT: Duration = Duration::from_millis(5_000);
const LEGACY_UID_TIMEOUT: Duration = Duration::from_millis(100);

/// A freshly opened transport together with what enumeration learned about the device behind it.
pub struct Connection {
    pub handle: Box<dyn Transport>,
    pub serial: String,
    pub bootstub: bool,
    /// Hardware type hint from enumeration, used when the hardware type request isn't implemented.
    pub bcd_hw_type: Option<HwType>,
}

/// Kinds of reboot the firmware can be asked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetKind {
    Reset,
    EnterBootstub,
    EnterBootloader,
}

/// Blocking session with a panda reached over USB or SPI.
pub struct Panda {
    handle: Option<Box<dyn Transport>>,
    config: PandaConfig,
    serial: Option<String>,
    bootstub: bool,
    bcd_hw_type: Option<HwType>,
    assume_f4_mcu: bool,
    hw_type: HwType,
    mcu_type: Option<McuType>,
    health_version: u8,
    can_version: u8,
    can_health_version: u8,
    can_rx_overflow_buffer: Vec<u8>,
    dfu_serial: Option<String>,
}

impl Panda {
    /// Connect to the first panda found, USB first, then SPI.
    pub fn new() -> Result<Panda> {
        Self::with_config(PandaConfig::default())
    }

    pub fn with_config(config: PandaConfig) -> Result<Panda> {
        let mut panda = Panda::disconnected(config);
        panda.connect()?;
        Ok(panda)
    }

    /// Build a session on top of an already opened transport and run the identification sequence.
    pub fn from_transport(connection: Connection, config: PandaConfig) -> Result<Panda> {
        let mut panda = Panda::disconnected(config);
        panda.attach(connection);
        panda.setup()?;
        Ok(panda)
    }

    /// Connect to the first panda, allow all output and wrap it in an [`AsyncCanAdapter`].
    pub fn new_async() -> Result<AsyncCanAdapter> {
        let mut panda = Panda::new()?;
        if panda.bootstub {
            return Err(crate::panda::error::Error::InBootstub.into());
        }

        panda.set_safety_mode(SafetyModel::AllOutput, 0)?;
        panda.can_reset_communications()?;

        // Flush frames that were queued before the reset
        while !panda.recv_frames(CAN_RECV_POLL_TIMEOUT)?.is_empty() {}

        Ok(AsyncCanAdapter::new(panda))
    }

    fn disconnected(config: PandaConfig) -> Panda {
        Panda {
            handle: None,
            serial: config.serial.clone(),
            config,
            bootstub: false,
            bcd_hw_type: None,
            assume_f4_mcu: false,
            hw_type: HwType::Unknown,
            mcu_type: None,
            health_version: 0,
            can_version: 0,
            can_health_version: 0,
            can_rx_overflow_buffer: vec![],
            dfu_serial: None,
        }
    }

    /// Open the transport and identify the device. Closes any previous handle first.
    pub fn connect(&mut self) -> Result<()> {
        self.connect_with(self.config.wait)
    }

    fn connect_with(&mut self, wait: bool) -> Result<()> {
        self.close();

        let connection = poll_open(wait, || self.open())?;
        self.attach(connection);
        self.setup()
    }

    fn open(&self) -> Result<Option<Connection>> {
        if let Some(connection) = Self::usb_connect(self.serial.as_deref(), self.config.claim)? {
            return Ok(Some(connection));
        }

        #[cfg(target_os = "linux")]
        if let Some(connection) =
            Self::spi_connect(self.serial.as_deref(), &self.config.spi_device)?
        {
            return Ok(Some(connection));
        }

        Ok(None)
    }

    fn attach(&mut self, connection: Connection) {
        self.handle = Some(connection.handle);
        self.serial = Some(connection.serial);
        self.bootstub = connection.bootstub;
        self.bcd_hw_type = connection.bcd_hw_type;
        self.can_rx_overflow_buffer.clear();
    }

    /// Identification sequence run after every (re)connect.
    fn setup(&mut self) -> Result<()> {
        let ret = self.control_read(Endpoint::HwType as u8, 0, 0, 0x40)?;

        // Old bootstubs don't implement the hardware type request, they answer with the flasher probe
        let missing_hw_type_endpoint = self.bootstub && ret.starts_with(&MISSING_HW_TYPE_SIGNATURE);
        self.assume_f4_mcu = self.bcd_hw_type.is_none() && missing_hw_type_endpoint;

        self.hw_type = self.hw_type_from_reply(&ret)?;
        self.mcu_type = Some(self.get_mcu_type()?);

        info!(
            "Connected to panda {} ({}, {:?}{})",
            self.serial.as_deref().unwrap_or_default(),
            self.hw_type,
            self.mcu_type,
            if self.bootstub { ", bootstub" } else { "" }
        );

        if self.bootstub {
            return Ok(());
        }

        match self.get_uid() {
            Ok(uid) => self.dfu_serial = PandaDfu::st_serial_to_dfu_serial(&uid, self.get_mcu_type()?),
            Err(e) => debug!("Failed to read UID: {}", e),
        }

        (self.health_version, self.can_version, self.can_health_version) =
            self.get_packets_versions()?;

        if self.config.claim && self.config.disable_checks {
            self.set_heartbeat_disabled()?;
            self.set_power_save(false)?;
        }

        if self.config.can_speed_kbps != config::DEFAULT_CAN_SPEED_KBPS {
            for bus in 0..3 {
                self.set_can_speed_kbps(bus, self.config.can_speed_kbps)?;
            }
        }

        Ok(())
    }

    /// Open the first USB panda, optionally matching a serial.
    pub fn usb_connect(serial: Option<&str>, claim: bool) -> Result<Option<Connection>> {
        let context = rusb::Context::new()?;

        for (device, desc) in find_devices(&context, VENDOR_ID, &PRODUCT_IDS)? {
            let this_serial = match read_serial(&device, &desc) {
                Ok(s) => s,
                Err(e) => {
                    debug!("Failed to read serial of USB panda: {}", e);
                    continue;
                }
            };

            if serial.is_some_and(|s| s != this_serial) {
                continue;
            }

            debug!("opening USB device {}", this_serial);
            let handle = UsbHandle::open(&device, claim)?;

            let bcd = bcd_device(&desc);
            let bcd_hw_type = match bcd {
                BCD_DEVICE_NO_HW_TYPE => None,
                bcd => HwType::from_repr((bcd >> 8) as u8),
            };

            return Ok(Some(Connection {
                handle: Box::new(handle),
                serial: this_serial,
                bootstub: (desc.product_id() & 0xf0) == 0xe0,
                bcd_hw_type,
            }));
        }

        Ok(None)
    }

    /// Open the SPI panda if one answers on `path`, optionally matching a serial.
    #[cfg(target_os = "linux")]
    pub fn spi_connect(
        serial: Option<&str>,
        path: &std::path::Path,
    ) -> Result<Option<Connection>> {
        use crate::transport::spidev::{SpidevBus, PANDA_SPEED_HZ};

        match SpidevBus::open(path, PANDA_SPEED_HZ) {
            Ok(bus) => Self::spi_connect_bus(serial, bus),
            Err(e) => {
                debug!("Failed to open {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Identify the panda behind an opened SPI bus. Firmware without the protocol version
    /// handshake is recognized by its UID reply.
    pub fn spi_connect_bus<B: SpiBus + Send + 'static>(
        serial: Option<&str>,
        bus: B,
    ) -> Result<Option<Connection>> {
        let mut handle = SpiHandle::new(bus);

        let (this_serial, bootstub, bcd_hw_type) = match handle.get_protocol_version() {
            Ok(info) => {
                if info.version != PROTOCOL_VERSION {
                    return Err(crate::panda::error::Error::SpiProtocolMismatch {
                        expected: PROTOCOL_VERSION,
                        got: info.version,
                    }
                    .into());
                }
                (info.serial(), info.bootstub()?, HwType::from_repr(info.hw_type))
            }
            Err(e) => {
                debug!("SPI protocol version handshake failed, using legacy probe: {}", e);
                let uid = match handle.control_read(
                    REQUEST_IN,
                    Endpoint::Uid as u8,
                    0,
                    0,
                    12,
                    LEGACY_UID_TIMEOUT,
                ) {
                    Ok(uid) => uid,
                    Err(e) => {
                        debug!("No panda on SPI: {}", e);
                        return Ok(None);
                    }
                };
                (hex::encode(uid), flasher_present(&mut handle), None)
            }
        };

        if serial.is_some_and(|s| s != this_serial) {
            return Ok(None);
        }

        Ok(Some(Connection {
            handle: Box::new(handle),
            serial: this_serial,
            bootstub,
            bcd_hw_type,
        }))
    }

    /// Serials of all pandas on USB and SPI.
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

        for (device, desc) in find_devices(&context, VENDOR_ID, &PRODUCT_IDS)? {
            match read_serial(&device, &desc) {
                Ok(serial) if serial.len() == 24 || serial == "pedal" => ret.push(serial),
                Ok(serial) => warn!(
                    "found device with panda descriptors but invalid serial: {}",
                    serial
                ),
                Err(e) => debug!("Failed to read serial of USB panda: {}", e),
            }
        }

        Ok(ret)
    }

    /// Zero or one serial, depending on whether a panda answers on the local SPI bus.
    pub fn spi_list() -> Vec<String> {
        #[cfg(target_os = "linux")]
        {
            let path = std::path::Path::new(crate::transport::spidev::DEFAULT_DEVICE);
            match Self::spi_connect(None, path) {
                Ok(Some(mut connection)) => {
                    connection.handle.close();
                    return vec![connection.serial];
                }
                Ok(None) => {}
                Err(e) => debug!("SPI panda not usable: {}", e),
            }
        }
        vec![]
    }

    /// Poll the device list at 10 Hz until `serial` (or any panda) shows up.
    pub fn wait_for_panda(serial: Option<&str>, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        loop {
            let serials = Self::list()?;
            let found = match serial {
                Some(serial) => serials.iter().any(|s| s == serial),
                None => !serials.is_empty(),
            };
            if found {
                return Ok(true);
            }
            if start.elapsed() > timeout {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Release the transport. Calling it on a closed session is a no-op.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            debug!("closed panda {}", self.serial.as_deref().unwrap_or_default());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Reboot the device. The transport disconnects, so the session is closed afterwards and
    /// optionally reconnected. Entering the ST bootloader never reconnects.
    pub fn reset(&mut self, kind: ResetKind, reconnect: bool) -> Result<()> {
        let (request, value) = match kind {
            ResetKind::Reset => (Endpoint::ResetDevice as u8, 0),
            ResetKind::EnterBootstub => (Endpoint::Reset as u8, ResetMode::EnterBootstub as u16),
            ResetKind::EnterBootloader => {
                (Endpoint::Reset as u8, ResetMode::EnterBootloader as u16)
            }
        };

        let handle = self.handle()?;
        let timeout = match handle.kind() {
            TransportKind::Usb => USB_RESET_TIMEOUT,
            TransportKind::Spi => SPI_RESET_TIMEOUT,
        };

        match handle.control_write_reset(REQUEST_OUT, request, value, 0, timeout) {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => debug!("reset: expected disconnect: {}", e),
            Err(e) => return Err(e),
        }

        self.close();
        if kind != ResetKind::EnterBootloader && reconnect {
            self.reconnect()?;
        }
        Ok(())
    }

    /// Reopen the session, retrying at 10 Hz for 15 s. A device that shows up in DFU mode instead is recovered.
    pub fn reconnect(&mut self) -> Result<()> {
        self.close();

        let start = Instant::now();
        while start.elapsed() < RECONNECT_TIMEOUT {
            std::thread::sleep(POLL_INTERVAL);

            match self.connect_with(false) {
                Ok(()) => return Ok(()),
                Err(e) => debug!(
                    "reconnecting is taking {:.1} seconds: {}",
                    start.elapsed().as_secs_f32(),
                    e
                ),
            }

            if let Some(dfu_serial) = self.dfu_serial.clone() {
                if let Ok(mut dfu) = PandaDfu::new(Some(&dfu_serial)) {
                    warn!("panda {} is in DFU mode, recovering", dfu_serial);
                    if let Err(e) = dfu.recover(&self.config.firmware_dir) {
                        error!("DFU recover failed: {}", e);
                    }
                }
            }
        }

        Err(crate::panda::error::Error::ReconnectFailed.into())
    }

    pub(crate) fn handle(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.handle
            .as_mut()
            .ok_or(Error::PandaError(crate::panda::error::Error::NotConnected))
    }

    pub(crate) fn control_write(&mut self, request: u8, value: u16, index: u16) -> Result<()> {
        let timeout = self.config.timeout;
        self.handle()?
            .control_write(REQUEST_OUT, request, value, index, &[], timeout)?;
        Ok(())
    }

    pub(crate) fn control_read(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>> {
        let timeout = self.config.timeout;
        self.handle()?
            .control_read(REQUEST_IN, request, value, index, length, timeout)
    }

    /// Control read that fails on a short reply.
    pub(crate) fn control_read_exact(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>> {
        let dat = self.control_read(request, value, index, length)?;
        if dat.len() < length as usize {
            return Err(crate::panda::error::Error::InvalidResponse {
                expected: length as usize,
                got: dat.len(),
            }
            .into());
        }
        Ok(dat)
    }

    /// Run `f` only if the firmware uses the same layout for `kind` as this library.
    fn versioned<T>(
        &mut self,
        kind: PacketKind,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let (firmware, library) = match kind {
            PacketKind::Health => (self.health_version, HEALTH_PACKET_VERSION),
            PacketKind::Can => (self.can_version, CAN_PACKET_VERSION),
            PacketKind::CanHealth => (self.can_health_version, CAN_HEALTH_PACKET_VERSION),
        };

        if firmware != library {
            return Err(crate::panda::error::Error::PacketVersionMismatch {
                kind,
                firmware,
                library,
            }
            .into());
        }

        f(self)
    }

    fn hw_type_from_reply(&self, ret: &[u8]) -> Result<HwType> {
        match (ret, self.bcd_hw_type) {
            ([hw_type], _) => HwType::from_repr(*hw_type)
                .ok_or(crate::panda::error::Error::UnknownHwType(*hw_type).into()),
            (_, Some(bcd_hw_type)) => Ok(bcd_hw_type),
            _ => Ok(HwType::Unknown),
        }
    }

    /// Hardware type as reported by the device, falling back to the enumeration hint when the reply isn't a single byte.
    pub fn get_type(&mut self) -> Result<HwType> {
        let ret = self.control_read(Endpoint::HwType as u8, 0, 0, 0x40)?;
        self.hw_type_from_reply(&ret)
    }

    /// Hardware type read at connect.
    pub fn hw_type(&self) -> HwType {
        self.hw_type
    }

    pub fn get_mcu_type(&self) -> Result<McuType> {
        match self.hw_type.mcu_type() {
            Some(mcu_type) => Ok(mcu_type),
            None if self.assume_f4_mcu => Ok(McuType::F4),
            None => {
                Err(crate::panda::error::Error::UnknownHwType(self.hw_type as u8).into())
            }
        }
    }

    pub fn is_bootstub(&self) -> bool {
        self.bootstub
    }

    /// Serial found at connect, "pedal" or 24 hex characters.
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn config(&self) -> &PandaConfig {
        &self.config
    }

    /// Returns `(serial, secret)` after checking the SHA-1 prefix of the provisioning record.
    pub fn get_serial(&mut self) -> Result<(String, String)> {
        let dat = self.control_read_exact(Endpoint::Serial as u8, 0, 0, 0x20)?;
        let hash = Sha1::digest(&dat[..0x1c]);
        if hash[..4] != dat[0x1c..0x20] {
            return Err(crate::panda::error::Error::HashMismatch.into());
        }

        let serial = dat[..0x10].to_str_lossy().into_owned();
        let secret = dat[0x10..0x10 + 10].to_str_lossy().into_owned();
        Ok((serial, secret))
    }

    pub fn get_secret(&mut self) -> Result<Vec<u8>> {
        self.control_read(Endpoint::Serial as u8, 1, 0, 0x10)
    }

    /// MCU unique id, hex encoded.
    pub fn get_uid(&mut self) -> Result<String> {
        let dat = self.control_read_exact(Endpoint::Uid as u8, 0, 0, 12)?;
        Ok(hex::encode(&dat[..12]))
    }

    /// Serial the ST bootloader will report for this device. Cached at connect so it survives a reset into DFU.
    pub fn get_dfu_serial(&mut self) -> Result<String> {
        if let Some(dfu_serial) = &self.dfu_serial {
            return Ok(dfu_serial.clone());
        }
        let uid = self.get_uid()?;
        let dfu_serial = PandaDfu::st_serial_to_dfu_serial(&uid, self.get_mcu_type()?)
            .ok_or(crate::panda::error::Error::InvalidResponse {
                expected: 24,
                got: uid.len(),
            })?;
        self.dfu_serial = Some(dfu_serial.clone());
        Ok(dfu_serial)
    }

    /// Firmware version string.
    pub fn get_version(&mut self) -> Result<String> {
        let dat = self.control_read(Endpoint::Version as u8, 0, 0, 0x40)?;
        Ok(dat.trim_end_with(|c| c == '\0').to_str_lossy().into_owned())
    }

    /// Signature of the running application, the last 128 bytes of the signed image.
    pub fn get_signature(&mut self) -> Result<Vec<u8>> {
        let mut ret = self.control_read(Endpoint::SignatureLow as u8, 0, 0, 0x40)?;
        ret.extend(self.control_read(Endpoint::SignatureHigh as u8, 0, 0, 0x40)?);
        Ok(ret)
    }

    /// `(health, can, can_health)` packet versions, all zero on firmware that predates them.
    pub fn get_packets_versions(&mut self) -> Result<(u8, u8, u8)> {
        let dat = self.control_read(Endpoint::PacketsVersions as u8, 0, 0, 3)?;
        match dat[..] {
            [health, can, can_health] => Ok((health, can, can_health)),
            _ => Ok((0, 0, 0)),
        }
    }

    pub fn health(&mut self) -> Result<Health> {
        self.versioned(PacketKind::Health, |s| {
            let dat = s.control_read(Endpoint::Health as u8, 0, 0, health::HEALTH_SIZE as u16)?;
            Ok(Health::try_from(&dat[..])?)
        })
    }

    pub fn can_health(&mut self, bus: u8) -> Result<CanHealth> {
        self.versioned(PacketKind::CanHealth, |s| {
            let dat = s.control_read(
                Endpoint::CanHealth as u8,
                bus as u16,
                0,
                health::CAN_HEALTH_SIZE as u16,
            )?;
            Ok(CanHealth::try_from(&dat[..])?)
        })
    }

    /// Send frames on the CAN write endpoint. Short writes are re-submitted, libusb I/O and overflow errors retried.
    pub fn can_send_many(&mut self, frames: &[Frame], timeout: Duration) -> Result<()> {
        self.versioned(PacketKind::Can, |s| {
            for chunk in pack_can_buffer(frames)? {
                let mut tx = &chunk[..];
                while !tx.is_empty() {
                    match s.handle()?.bulk_write(BulkEndpoint::CanWrite as u8, tx, timeout) {
                        Ok(n) => {
                            tx = &tx[n.min(tx.len())..];
                            if !tx.is_empty() {
                                error!("CAN: PARTIAL SEND MANY, RETRYING");
                            }
                        }
                        Err(Error::LibUsbError(rusb::Error::Io | rusb::Error::Overflow)) => {
                            error!("CAN: BAD SEND MANY, RETRYING");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok(())
        })
    }

    pub fn can_send(&mut self, frame: &Frame, timeout: Duration) -> Result<()> {
        self.can_send_many(std::slice::from_ref(frame), timeout)
    }

    /// Read received frames. Bytes of a frame split over two reads are kept until the next call.
    pub fn can_recv(&mut self) -> Result<Vec<Frame>> {
        let timeout = self.config.timeout;
        self.recv_frames(timeout)
    }

    fn recv_frames(&mut self, timeout: Duration) -> Result<Vec<Frame>> {
        let dat = loop {
            match self
                .handle()?
                .bulk_read(BulkEndpoint::CanRead as u8, CAN_RECV_SIZE, timeout)
            {
                Ok(dat) => break dat,
                Err(Error::LibUsbError(rusb::Error::Io | rusb::Error::Overflow)) => {
                    error!("CAN: BAD RECV, RETRYING");
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        };

        self.can_rx_overflow_buffer.extend_from_slice(&dat);
        match unpack_can_buffer(&mut self.can_rx_overflow_buffer) {
            Ok(frames) => Ok(frames),
            Err(e) => {
                self.can_rx_overflow_buffer.clear();
                Err(e)
            }
        }
    }
}

/// Call `open` until it finds a device. Without `wait` the first miss or error is returned.
/// With it, errors are logged and polling continues.
fn poll_open(
    wait: bool,
    mut open: impl FnMut() -> Result<Option<Connection>>,
) -> Result<Connection> {
    loop {
        match open() {
            Ok(Some(connection)) => return Ok(connection),
            Ok(None) if !wait => return Err(Error::NotFound),
            Err(e) if !wait => return Err(e),
            Ok(None) => {}
            Err(e) => debug!("waiting for panda: {}", e),
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Probe for the bootstub flasher.
pub(crate) fn flasher_present(handle: &mut dyn Transport) -> bool {
    match handle.control_read(
        REQUEST_IN,
        BootstubEndpoint::FlasherProbe as u8,
        0,
        0,
        0xc,
        crate::transport::DEFAULT_TIMEOUT,
    ) {
        Ok(dat) => dat.len() >= 8 && dat[4..8] == FLASHER_SIGNATURE,
        Err(e) => {
            debug!("flasher probe failed: {}", e);
            false
        }
    }
}

impl Drop for Panda {
    fn drop(&mut self) {
        self.close();
    }
}

impl CanAdapter for Panda {
    /// Sends a buffer of CAN messages to the panda.
    fn send(&mut self, frames: &mut VecDeque<Frame>) -> Result<()> {
        if frames.is_empty() {
            return Ok(());
        }

        let frames: Vec<Frame> = frames.drain(..).collect();
        let timeout = self.config.timeout;
        self.can_send_many(&frames, timeout)
    }

    /// Reads the current buffer of available CAN messages from the panda. Returns an empty vector if no messages are available.
    fn recv(&mut self) -> Result<Vec<Frame>> {
        match self.recv_frames(CAN_RECV_POLL_TIMEOUT) {
            Err(Error::LibUsbError(rusb::Error::Timeout)) | Err(Error::Timeout) => Ok(vec![]),
            r => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::spi::mock::MockPanda;

    const UID: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

    fn version_reply(hw_type: u8, product_id: u8, version: u8) -> Vec<u8> {
        let mut reply = UID.to_vec();
        reply.extend([hw_type, product_id, version]);
        reply
    }

    /// Answers the legacy UID read and the flasher probe.
    fn legacy_firmware(bootstub: bool) -> MockPanda {
        MockPanda::new(move |_, data| match data[0] {
            0xc3 => UID.to_vec(),
            0xb0 if bootstub => vec![0xff, 0, 0xb0, 0x3e, 0xde, 0xad, 0xd0, 0x0d],
            _ => vec![],
        })
    }

    #[test]
    fn spi_version_handshake() {
        let mut bus = MockPanda::new(|_, _| vec![]);
        bus.version_reply = version_reply(HwType::Tres as u8, 0xee, PROTOCOL_VERSION);

        let connection = Panda::spi_connect_bus(None, bus).unwrap().unwrap();
        assert_eq!(connection.serial, "000102030405060708090a0b");
        assert!(connection.bootstub);
        assert_eq!(connection.bcd_hw_type, Some(HwType::Tres));
        assert_eq!(connection.handle.kind(), TransportKind::Spi);
    }

    #[test]
    fn spi_protocol_mismatch() {
        let mut bus = MockPanda::new(|_, _| vec![]);
        bus.version_reply = version_reply(HwType::Tres as u8, 0xcc, PROTOCOL_VERSION + 1);

        let r = Panda::spi_connect_bus(None, bus);
        assert_eq!(
            r.err(),
            Some(Error::PandaError(
                crate::panda::error::Error::SpiProtocolMismatch {
                    expected: PROTOCOL_VERSION,
                    got: PROTOCOL_VERSION + 1,
                }
            ))
        );
    }

    #[test]
    fn spi_legacy_firmware() {
        // No version reply, the handshake fails
        let connection = Panda::spi_connect_bus(None, legacy_firmware(false))
            .unwrap()
            .unwrap();
        assert_eq!(connection.serial, "000102030405060708090a0b");
        assert!(!connection.bootstub);
        assert_eq!(connection.bcd_hw_type, None);

        let connection = Panda::spi_connect_bus(None, legacy_firmware(true))
            .unwrap()
            .unwrap();
        assert!(connection.bootstub);
    }

    #[test]
    fn spi_serial_filter() {
        let mut bus = MockPanda::new(|_, _| vec![]);
        bus.version_reply = version_reply(HwType::Tres as u8, 0xcc, PROTOCOL_VERSION);
        assert!(Panda::spi_connect_bus(Some("ffffffffffffffffffffffff"), bus)
            .unwrap()
            .is_none());
    }

    #[test]
    fn spi_nothing_attached() {
        let mut bus = legacy_firmware(false);
        bus.nack_endpoints = vec![0];
        assert!(Panda::spi_connect_bus(None, bus).unwrap().is_none());
    }

    fn spi_connection() -> Connection {
        Connection {
            handle: Box::new(SpiHandle::new(MockPanda::new(|_, _| vec![]))),
            serial: "000102030405060708090a0b".to_string(),
            bootstub: false,
            bcd_hw_type: None,
        }
    }

    #[test]
    fn waiting_open_survives_errors() {
        let mut attempts = 0;
        let connection = poll_open(true, || {
            attempts += 1;
            match attempts {
                1 => Err(Error::LibUsbError(rusb::Error::Access)),
                2 => Ok(None),
                3 => Err(Error::LibUsbError(rusb::Error::NoDevice)),
                _ => Ok(Some(spi_connection())),
            }
        })
        .unwrap();
        assert_eq!(attempts, 4);
        assert_eq!(connection.serial, "000102030405060708090a0b");
    }

    #[test]
    fn open_without_wait() {
        let r = poll_open(false, || Err(Error::LibUsbError(rusb::Error::Io)));
        assert_eq!(r.err(), Some(Error::LibUsbError(rusb::Error::Io)));

        let r = poll_open(false, || Ok(None));
        assert_eq!(r.err(), Some(Error::NotFound));
    }

    #[test]
    fn adapter_poll_timeout_covers_large_reads() {
        // 16 KiB at USB full speed takes over 10 ms
        assert!(CAN_RECV_POLL_TIMEOUT >= Duration::from_millis(100));
    }
}
