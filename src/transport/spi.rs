//! SPI backend. Frames the vendor request model over a raw SPI bus.
//!
//! One transaction looks like this:
//!
//! ```text
//! host -> SYNC | endpoint | tx_len (BE u16) | max_rx_len (BE u16) | xor
//! dev  -> ACK or NACK
//! host -> payload | xor
//! dev  -> ACK or NACK
//! dev  -> rx_len (BE u16) | reply | xor
//! ```
//!
//! The header and each payload segment XOR to zero including their checksum byte. A NACK is surfaced as
//! [`Error::Nack`] and never retried here. The next SYNC resynchronizes the device after a failed transaction.

use std::io;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::transport::error::Error;
use crate::transport::{Transport, TransportKind, USBPACKET_MAX_SIZE};
use crate::Result;

pub const SYNC: u8 = 0x5a;
pub const ACK: u8 = 0x79;
pub const NACK: u8 = 0x1f;

/// Protocol version the library speaks. Anything else needs a reflash.
pub const PROTOCOL_VERSION: u8 = 2;

const HEADER_ACK_FILL: u8 = 0x11;
const DATA_ACK_FILL: u8 = 0x13;
const MIN_ACK_TIMEOUT: Duration = Duration::from_millis(100);
const VERSION_ECHO_TIMEOUT: Duration = Duration::from_millis(10);
const VERSION_ATTEMPTS: usize = 10;
const VERSION_REQUEST: &[u8] = b"VERSION";
const VERSION_MAX_LEN: usize = 1000;

/// Largest segment of a bulk transfer.
pub const XFER_SIZE: usize = USBPACKET_MAX_SIZE * 31;

/// Full duplex byte bus the framing runs on.
pub trait SpiBus {
    /// Clock out `tx` and return the bytes clocked in at the same time.
    fn transfer(&mut self, tx: &[u8]) -> io::Result<Vec<u8>>;

    /// Clock out `len` zero bytes.
    fn read(&mut self, len: usize) -> io::Result<Vec<u8>> {
        self.transfer(&vec![0; len])
    }

    /// Take the device-wide lock for the duration of a transaction.
    fn lock(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn unlock(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Holds the bus lock, releasing it on drop.
pub struct SpiLock<'a, B: SpiBus> {
    bus: &'a mut B,
}

impl<'a, B: SpiBus> SpiLock<'a, B> {
    pub(crate) fn acquire(bus: &'a mut B) -> io::Result<Self> {
        bus.lock()?;
        Ok(Self { bus })
    }
}

impl<B: SpiBus> Deref for SpiLock<'_, B> {
    type Target = B;
    fn deref(&self) -> &B {
        self.bus
    }
}

impl<B: SpiBus> DerefMut for SpiLock<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.bus
    }
}

impl<B: SpiBus> Drop for SpiLock<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.bus.unlock() {
            debug!("failed to release SPI lock: {}", e);
        }
    }
}

pub fn calculate_checksum(dat: &[u8]) -> u8 {
    dat.iter().fold(0, |acc, &x| acc ^ x)
}

/// CRC-8 over the protocol version reply. Bytes are processed last to first.
pub fn crc8_pedal(dat: &[u8]) -> u8 {
    const POLY: u8 = 0xd5;
    let mut crc: u8 = 0xff;
    for &b in dat.iter().rev() {
        crc ^= b;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn timed_out(start: Instant, timeout: Duration) -> bool {
    !timeout.is_zero() && start.elapsed() >= timeout
}

/// Reply to the protocol version request.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    pub uid: [u8; 12],
    pub hw_type: u8,
    pub product_id: u8,
    pub version: u8,
}

impl VersionInfo {
    /// Device serial, the hex encoded UID.
    pub fn serial(&self) -> String {
        hex::encode(self.uid)
    }

    pub fn bootstub(&self) -> std::result::Result<bool, Error> {
        match self.product_id {
            0xcc => Ok(false),
            0xee => Ok(true),
            _ => Err(Error::InvalidResponse),
        }
    }
}

impl TryFrom<&[u8]> for VersionInfo {
    type Error = Error;
    fn try_from(dat: &[u8]) -> std::result::Result<Self, Error> {
        if dat.len() < 15 {
            return Err(Error::InvalidResponse);
        }
        let mut uid = [0; 12];
        uid.copy_from_slice(&dat[..12]);
        Ok(VersionInfo {
            uid,
            hw_type: dat[12],
            product_id: dat[13],
            version: dat[14],
        })
    }
}

/// Panda reached over SPI.
pub struct SpiHandle<B: SpiBus> {
    bus: Option<B>,
}

impl<B: SpiBus> SpiHandle<B> {
    pub fn new(bus: B) -> Self {
        Self { bus: Some(bus) }
    }

    fn acquire(&mut self) -> Result<SpiLock<'_, B>> {
        let bus = self
            .bus
            .as_mut()
            .ok_or(crate::panda::error::Error::NotConnected)?;
        Ok(SpiLock::acquire(bus).map_err(Error::from)?)
    }

    /// Ask the device for its identity and protocol version.
    pub fn get_protocol_version(&mut self) -> Result<VersionInfo> {
        let mut spi = self.acquire()?;

        let mut err = crate::Error::SpiError(Error::MissingAck);
        for attempt in 0..VERSION_ATTEMPTS {
            match get_version(&mut *spi) {
                Ok(dat) => return Ok(VersionInfo::try_from(&dat[..])?),
                Err(e) => {
                    debug!("SPI get protocol version failed (attempt {}): {}", attempt, e);
                    err = e;
                }
            }
        }
        Err(err)
    }

    fn transfer(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
        max_rx_len: usize,
        expect_disconnect: bool,
    ) -> Result<Vec<u8>> {
        debug!(
            "starting transfer: endpoint={}, max_rx_len={}",
            endpoint, max_rx_len
        );
        let mut spi = self.acquire()?;
        transfer_raw(
            &mut *spi,
            endpoint,
            data,
            timeout,
            max_rx_len,
            expect_disconnect,
        )
    }
}

fn get_version<B: SpiBus>(spi: &mut B) -> Result<Vec<u8>> {
    spi.transfer(VERSION_REQUEST)?;

    debug!("- waiting for echo");
    let start = Instant::now();
    let version_bytes = loop {
        let dat = spi.read(VERSION_REQUEST.len() + 2)?;
        if dat.starts_with(VERSION_REQUEST) {
            break dat;
        }
        if start.elapsed() > VERSION_ECHO_TIMEOUT {
            return Err(Error::MissingAck.into());
        }
    };

    let n = version_bytes.len();
    let rlen = u16::from_le_bytes([version_bytes[n - 2], version_bytes[n - 1]]) as usize;
    if rlen > VERSION_MAX_LEN {
        return Err(Error::ResponseTooLong {
            got: rlen,
            max: VERSION_MAX_LEN,
        }
        .into());
    }

    let dat = spi.read(rlen + 1)?;
    let resp = &dat[..rlen];

    let mut crc_input = version_bytes.clone();
    crc_input.extend_from_slice(resp);
    if crc8_pedal(&crc_input) != dat[rlen] {
        return Err(Error::BadChecksum.into());
    }

    Ok(resp.to_vec())
}

fn wait_for_ack<B: SpiBus>(spi: &mut B, fill: u8, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        let dat = spi.transfer(&[fill])?;
        match dat.first() {
            Some(&NACK) => return Err(Error::Nack.into()),
            Some(&ACK) => return Ok(()),
            _ => {}
        }
        if timed_out(start, timeout) {
            return Err(crate::Error::Timeout);
        }
    }
}

fn transfer_raw<B: SpiBus>(
    spi: &mut B,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
    max_rx_len: usize,
    expect_disconnect: bool,
) -> Result<Vec<u8>> {
    let max_rx_len = max_rx_len.max(USBPACKET_MAX_SIZE);
    let ack_timeout = if timeout.is_zero() {
        timeout
    } else {
        timeout.max(MIN_ACK_TIMEOUT)
    };

    debug!("- send header");
    let mut header = vec![SYNC, endpoint];
    header.extend_from_slice(&(data.len() as u16).to_be_bytes());
    header.extend_from_slice(&(max_rx_len as u16).to_be_bytes());
    header.push(calculate_checksum(&header));
    spi.transfer(&header)?;

    debug!("- waiting for header ACK");
    wait_for_ack(spi, HEADER_ACK_FILL, MIN_ACK_TIMEOUT)?;

    debug!("- sending data");
    let mut packet = data.to_vec();
    packet.push(calculate_checksum(data));
    spi.transfer(&packet)?;

    if expect_disconnect {
        debug!("- expecting disconnect, returning");
        return Ok(vec![]);
    }

    debug!("- waiting for data ACK");
    wait_for_ack(spi, DATA_ACK_FILL, ack_timeout)?;

    let mut dat = spi.read(2)?;
    let response_len = u16::from_be_bytes([dat[0], dat[1]]) as usize;
    if response_len > max_rx_len {
        return Err(Error::ResponseTooLong {
            got: response_len,
            max: max_rx_len,
        }
        .into());
    }

    dat.extend(spi.read(response_len + 1)?);
    if calculate_checksum(&dat) != 0 {
        return Err(Error::BadChecksum.into());
    }

    Ok(dat[2..2 + response_len].to_vec())
}

/// Control request payload: request, value, index, length. Little endian like the USB setup packet.
fn control_payload(request: u8, value: u16, index: u16, length: u16) -> Vec<u8> {
    let mut ret = vec![request];
    ret.extend_from_slice(&value.to_le_bytes());
    ret.extend_from_slice(&index.to_le_bytes());
    ret.extend_from_slice(&length.to_le_bytes());
    ret
}

impl<B: SpiBus + Send> Transport for SpiHandle<B> {
    fn kind(&self) -> TransportKind {
        TransportKind::Spi
    }

    fn control_write(
        &mut self,
        _request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        _data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let payload = control_payload(request, value, index, 0);
        self.transfer(0, &payload, timeout, USBPACKET_MAX_SIZE, false)?;
        Ok(0)
    }

    fn control_read(
        &mut self,
        _request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let payload = control_payload(request, value, index, length);
        self.transfer(0, &payload, timeout, length as usize, false)
    }

    fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        for chunk in data.chunks(XFER_SIZE) {
            self.transfer(endpoint, chunk, timeout, USBPACKET_MAX_SIZE, false)?;
        }
        Ok(data.len())
    }

    fn bulk_read(&mut self, endpoint: u8, length: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut ret = vec![];
        while ret.len() < length {
            let dat = self.transfer(endpoint, &[], timeout, XFER_SIZE, false)?;
            let n = dat.len();
            ret.extend(dat);
            if n < XFER_SIZE {
                break;
            }
        }
        Ok(ret)
    }

    fn control_write_reset(
        &mut self,
        _request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<()> {
        let payload = control_payload(request, value, index, 0);
        self.transfer(0, &payload, timeout, USBPACKET_MAX_SIZE, true)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.bus.take().is_some() {
            debug!("closed SPI handle");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockPanda;
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn header_checksum_is_zero() {
        let mut header = vec![SYNC, 3];
        header.extend_from_slice(&300u16.to_be_bytes());
        header.extend_from_slice(&64u16.to_be_bytes());
        header.push(calculate_checksum(&header));
        assert_eq!(header.len(), 7);
        assert_eq!(calculate_checksum(&header), 0);
    }

    #[test]
    fn crc8_pedal_known_values() {
        assert_eq!(crc8_pedal(&[]), 0xff);
        // Single byte: 0xff ^ 0x00 shifted through the polynomial eight times
        assert_eq!(crc8_pedal(&[0xff]), 0x00);
        assert_ne!(crc8_pedal(b"VERSION"), crc8_pedal(b"VERSIOM"));
    }

    #[test]
    fn control_read_round_trip() {
        let bus = MockPanda::new(|endpoint, data| {
            assert_eq!(endpoint, 0);
            assert_eq!(data, &[0xc1, 0, 0, 0, 0, 0x40, 0]);
            vec![0x07]
        });
        let mut handle = SpiHandle::new(bus);
        let resp = handle
            .control_read(0xc0, 0xc1, 0, 0, 0x40, TIMEOUT)
            .unwrap();
        assert_eq!(resp, vec![0x07]);

        let bus = handle.bus.as_ref().unwrap();
        assert_eq!(bus.locks, 1);
        assert_eq!(bus.unlocks, 1);
    }

    #[test]
    fn ack_polling() {
        let mut bus = MockPanda::new(|_, _| vec![1, 2, 3]);
        bus.ack_delay = 5;
        let mut handle = SpiHandle::new(bus);
        let resp = handle.bulk_read(1, 16, TIMEOUT).unwrap();
        assert_eq!(resp, vec![1, 2, 3]);
    }

    #[test]
    fn nack_is_surfaced() {
        let mut bus = MockPanda::new(|_, _| vec![]);
        bus.nack_endpoints = vec![5];
        let mut handle = SpiHandle::new(bus);
        let r = handle.bulk_write(5, &[1, 2, 3], TIMEOUT);
        assert_eq!(r, Err(crate::Error::SpiError(Error::Nack)));

        // Only one attempt was made
        let bus = handle.bus.as_ref().unwrap();
        assert!(bus.transactions.is_empty());
        assert_eq!(bus.locks, 1);
    }

    #[test]
    fn bad_reply_checksum() {
        let mut bus = MockPanda::new(|_, _| vec![0xde, 0xad]);
        bus.corrupt_reply = true;
        let mut handle = SpiHandle::new(bus);
        let r = handle.control_read(0xc0, 0xd6, 0, 0, 0x40, TIMEOUT);
        assert_eq!(r, Err(crate::Error::SpiError(Error::BadChecksum)));
    }

    #[test]
    fn reply_too_long() {
        let bus = MockPanda::new(|_, _| vec![0; 100]);
        let mut handle = SpiHandle::new(bus);
        let r = handle.control_read(0xc0, 0xd6, 0, 0, 0x40, TIMEOUT);
        assert_eq!(
            r,
            Err(crate::Error::SpiError(Error::ResponseTooLong { got: 100, max: 64 }))
        );
    }

    #[test]
    fn bulk_write_is_segmented() {
        let bus = MockPanda::new(|_, _| vec![]);
        let mut handle = SpiHandle::new(bus);
        let data = vec![0x55; XFER_SIZE + 10];
        assert_eq!(handle.bulk_write(2, &data, TIMEOUT).unwrap(), data.len());

        let bus = handle.bus.as_ref().unwrap();
        assert_eq!(bus.transactions.len(), 2);
        assert_eq!(bus.transactions[0].1.len(), XFER_SIZE);
        assert_eq!(bus.transactions[1].1.len(), 10);
    }

    #[test]
    fn protocol_version() {
        let mut bus = MockPanda::new(|_, _| vec![]);
        let mut reply: Vec<u8> = (0..12).collect();
        reply.extend([0x09, 0xcc, PROTOCOL_VERSION]);
        bus.version_reply = reply;

        let mut handle = SpiHandle::new(bus);
        let info = handle.get_protocol_version().unwrap();
        assert_eq!(info.serial(), "000102030405060708090a0b");
        assert_eq!(info.hw_type, 0x09);
        assert_eq!(info.bootstub(), Ok(false));
        assert_eq!(info.version, PROTOCOL_VERSION);
    }

    #[test]
    fn closed_handle() {
        let mut handle = SpiHandle::new(MockPanda::new(|_, _| vec![]));
        handle.close();
        handle.close();
        let r = handle.control_read(0xc0, 0xd6, 0, 0, 0x40, TIMEOUT);
        assert_eq!(
            r,
            Err(crate::Error::PandaError(
                crate::panda::error::Error::NotConnected
            ))
        );
    }
}
