//! UART passthrough and the K-Line helpers built on top of it.
use std::time::Instant;

use tracing::{debug, error};

use crate::panda::constants::{BulkEndpoint, Endpoint, SerialPort};
use crate::panda::Panda;
use crate::Result;

const SERIAL_READ_SIZE: u16 = 0x40;
const SERIAL_WRITE_SIZE: usize = 0x20;
const KLINE_SEGMENT_SIZE: usize = 0xf;

/// Select the wakeup lines. Both lines share one request value.
fn kline_lines(k: bool, l: bool) -> Result<u16> {
    match (k, l) {
        (true, true) => Ok(2),
        (true, false) => Ok(0),
        (false, true) => Ok(1),
        (false, false) => Err(crate::panda::error::Error::NoKLineSelected.into()),
    }
}

/// 8-bit sum checksum appended to K-Line messages.
pub fn kline_checksum(dat: &[u8]) -> u8 {
    dat.iter().fold(0u8, |acc, &x| acc.wrapping_add(x))
}

impl Panda {
    /// Read everything currently buffered for `port`.
    pub fn serial_read(&mut self, port: SerialPort) -> Result<Vec<u8>> {
        let mut ret = vec![];
        loop {
            let dat = self.control_read(Endpoint::SerialRead as u8, port as u16, 0, SERIAL_READ_SIZE)?;
            if dat.is_empty() {
                break;
            }
            ret.extend(dat);
        }
        Ok(ret)
    }

    /// Write to `port` in 32 byte chunks, each prefixed with the port number. Returns the number of bytes accepted.
    pub fn serial_write(&mut self, port: SerialPort, dat: &[u8]) -> Result<usize> {
        let timeout = self.config.timeout;
        let mut ret = 0;
        for chunk in dat.chunks(SERIAL_WRITE_SIZE) {
            let mut packet = vec![port as u8];
            packet.extend_from_slice(chunk);
            ret += self
                .handle()?
                .bulk_write(BulkEndpoint::Serial as u8, &packet, timeout)?;
        }
        Ok(ret)
    }

    pub fn serial_clear(&mut self, port: SerialPort) -> Result<()> {
        self.control_write(Endpoint::SerialClear as u8, port as u16, 0)
    }

    /// Pulse the K and/or L line low.
    pub fn kline_wakeup(&mut self, k: bool, l: bool) -> Result<()> {
        debug!("kline wakeup...");
        self.control_write(Endpoint::KLineWakeup as u8, kline_lines(k, l)?, 0)?;
        debug!("kline wakeup done");
        Ok(())
    }

    /// 5 baud initialization with `addr`.
    pub fn kline_5baud(&mut self, addr: u8, k: bool, l: bool) -> Result<()> {
        debug!("kline 5 baud...");
        self.control_write(Endpoint::KLine5Baud as u8, kline_lines(k, l)?, addr as u16)?;
        debug!("kline 5 baud done");
        Ok(())
    }

    pub fn kline_drain(&mut self, bus: SerialPort) -> Result<Vec<u8>> {
        let mut ret = vec![];
        loop {
            let dat = self.control_read(Endpoint::SerialRead as u8, bus as u16, 0, SERIAL_READ_SIZE)?;
            if dat.is_empty() {
                break;
            }
            debug!("kline drain: 0x{}", hex::encode(&dat));
            ret.extend(dat);
        }
        Ok(ret)
    }

    /// Read exactly `cnt` bytes, polling until they arrive or the session timeout passes.
    pub fn kline_ll_recv(&mut self, cnt: usize, bus: SerialPort) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut ret = vec![];
        while ret.len() < cnt {
            let remaining = (cnt - ret.len()).min(SERIAL_READ_SIZE as usize) as u16;
            let dat = self.control_read(Endpoint::SerialRead as u8, bus as u16, 0, remaining)?;
            if !dat.is_empty() {
                debug!("kline recv: 0x{}", hex::encode(&dat));
            }
            ret.extend(dat);

            if ret.len() < cnt && start.elapsed() > self.config.timeout {
                return Err(crate::Error::Timeout);
            }
        }
        ret.truncate(cnt);
        Ok(ret)
    }

    /// Send a K-Line message in 15 byte segments. Every segment is read back from the line and compared.
    pub fn kline_send(&mut self, dat: &[u8], bus: SerialPort, checksum: bool) -> Result<()> {
        self.kline_drain(bus)?;

        let mut msg = dat.to_vec();
        if checksum {
            msg.push(kline_checksum(dat));
        }

        let timeout = self.config.timeout;
        let mut echo_ok = true;
        for (i, segment) in msg.chunks(KLINE_SEGMENT_SIZE).enumerate() {
            debug!("kline send: 0x{}", hex::encode(segment));
            let mut packet = vec![bus as u8];
            packet.extend_from_slice(segment);
            self.handle()?
                .bulk_write(BulkEndpoint::Serial as u8, &packet, timeout)?;

            let echo = self.kline_ll_recv(segment.len(), bus)?;
            if echo != segment {
                error!("**** ECHO ERROR {} ****", i * KLINE_SEGMENT_SIZE);
                error!("0x{}", hex::encode(&echo));
                error!("0x{}", hex::encode(segment));
                echo_ok = false;
            }
        }

        match echo_ok {
            true => Ok(()),
            false => Err(crate::panda::error::Error::KLineEcho.into()),
        }
    }

    /// Receive one K-Line message. The last header byte is the payload length, a checksum byte follows the payload.
    pub fn kline_recv(&mut self, bus: SerialPort, header_len: usize) -> Result<Vec<u8>> {
        let mut msg = self.kline_ll_recv(header_len, bus)?;
        let len = msg.last().copied().unwrap_or(0) as usize;
        msg.extend(self.kline_ll_recv(len + 1, bus)?);
        Ok(msg)
    }
}
