//! Session configuration and the one-shot configuration requests.
use std::path::PathBuf;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::panda::constants::{Endpoint, SafetyModel, SerialPort};
use crate::panda::Panda;
use crate::Result;

pub const DEFAULT_CAN_SPEED_KBPS: u16 = 500;

/// Value of [`Panda::can_clear`] that clears the receive queue instead of a transmit queue.
pub const CAN_CLEAR_RX_QUEUE: u16 = 0xffff;

/// Configuration passed to [`Panda::with_config`].
#[derive(Debug, Clone)]
pub struct PandaConfig {
    /// Only connect to the panda with this serial
    pub serial: Option<String>,
    /// Claim the USB interface and allow sending configuration requests on connect
    pub claim: bool,
    /// Disable the heartbeat check and power save on connect
    pub disable_checks: bool,
    /// Applied to all buses on connect when it differs from the firmware default of 500 kbps
    pub can_speed_kbps: u16,
    /// Keep polling until a panda shows up instead of failing
    pub wait: bool,
    /// Directory holding the built application and bootstub images
    pub firmware_dir: PathBuf,
    /// SPI character device of an internal panda
    pub spi_device: PathBuf,
    /// Timeout of a single transfer
    pub timeout: Duration,
}

impl Default for PandaConfig {
    fn default() -> Self {
        Self {
            serial: None,
            claim: true,
            disable_checks: true,
            can_speed_kbps: DEFAULT_CAN_SPEED_KBPS,
            wait: false,
            firmware_dir: PathBuf::from("board/obj"),
            spi_device: PathBuf::from("/dev/spidev0.0"),
            timeout: crate::transport::DEFAULT_TIMEOUT,
        }
    }
}

impl PandaConfig {
    pub fn with_serial(serial: &str) -> Self {
        Self {
            serial: Some(serial.to_owned()),
            ..Default::default()
        }
    }
}

/// Request value for a bit rate, the firmware takes units of 100 bps.
fn can_speed_value(speed: u16) -> Result<u16> {
    speed
        .checked_mul(10)
        .ok_or(crate::panda::error::Error::CanSpeedOutOfRange(speed).into())
}

impl Panda {
    pub fn set_safety_mode(&mut self, mode: SafetyModel, param: u16) -> Result<()> {
        self.control_write(Endpoint::SafetyModel as u8, mode as u16, param)
    }

    pub fn set_can_loopback(&mut self, enable: bool) -> Result<()> {
        self.control_write(Endpoint::Loopback as u8, enable as u16, 0)
    }

    /// Arbitration phase bitrate of `bus`.
    pub fn set_can_speed_kbps(&mut self, bus: u8, speed: u16) -> Result<()> {
        self.control_write(Endpoint::CanSpeed as u8, bus as u16, can_speed_value(speed)?)
    }

    /// CAN-FD data phase bitrate of `bus`.
    pub fn set_can_data_speed_kbps(&mut self, bus: u8, speed: u16) -> Result<()> {
        self.control_write(Endpoint::CanDataSpeed as u8, bus as u16, can_speed_value(speed)?)
    }

    pub fn set_canfd_non_iso(&mut self, bus: u8, non_iso: bool) -> Result<()> {
        self.control_write(Endpoint::CanFdNonIso as u8, bus as u16, non_iso as u16)
    }

    /// Route the OBD-II port to the third CAN transceiver.
    pub fn set_obd(&mut self, obd: bool) -> Result<()> {
        self.control_write(Endpoint::Obd as u8, obd as u16, 0)
    }

    pub fn set_power_save(&mut self, enable: bool) -> Result<()> {
        self.control_write(Endpoint::PowerSave as u8, enable as u16, 0)
    }

    pub fn set_heartbeat_disabled(&mut self) -> Result<()> {
        self.control_write(Endpoint::HeartbeatDisabled as u8, 0, 0)
    }

    pub fn send_heartbeat(&mut self, engaged: bool) -> Result<()> {
        self.control_write(Endpoint::Heartbeat as u8, engaged as u16, 0)
    }

    pub fn set_uart_baud(&mut self, uart: SerialPort, rate: u32) -> Result<()> {
        self.control_write(Endpoint::UartBaud as u8, uart as u16, (rate / 300) as u16)
    }

    pub fn set_uart_parity(&mut self, uart: SerialPort, parity: u8) -> Result<()> {
        self.control_write(Endpoint::UartParity as u8, uart as u16, parity as u16)
    }

    pub fn set_uart_callback(&mut self, uart: SerialPort, install: bool) -> Result<()> {
        self.control_write(Endpoint::UartCallback as u8, uart as u16, install as u16)
    }

    pub fn set_ir_power(&mut self, percentage: u8) -> Result<()> {
        self.control_write(Endpoint::IrPower as u8, percentage as u16, 0)
    }

    pub fn set_fan_power(&mut self, percentage: u8) -> Result<()> {
        self.control_write(Endpoint::FanPower as u8, percentage as u16, 0)
    }

    pub fn get_fan_rpm(&mut self) -> Result<u16> {
        let dat = self.control_read_exact(Endpoint::FanRpm as u8, 0, 0, 2)?;
        Ok(u16::from_le_bytes([dat[0], dat[1]]))
    }

    pub fn set_siren(&mut self, enabled: bool) -> Result<()> {
        self.control_write(Endpoint::Siren as u8, enabled as u16, 0)
    }

    pub fn set_green_led(&mut self, enabled: bool) -> Result<()> {
        self.control_write(Endpoint::GreenLed as u8, enabled as u16, 0)
    }

    /// Override the harness relays.
    pub fn set_relay(&mut self, intercept: bool, ignition: bool) -> Result<()> {
        let value = (intercept as u16) | ((ignition as u16) << 1);
        self.control_write(Endpoint::Relay as u8, value, 0)
    }

    pub fn set_som_gpio(&mut self, enabled: bool) -> Result<()> {
        self.control_write(Endpoint::SomGpio as u8, enabled as u16, 0)
    }

    pub fn enable_deepsleep(&mut self) -> Result<()> {
        self.control_write(Endpoint::Deepsleep as u8, 0, 0)
    }

    pub fn set_clock_source_period(&mut self, period: u16) -> Result<()> {
        self.control_write(Endpoint::ClockSourcePeriod as u8, period, 0)
    }

    /// Calls per second of interrupt `irqnum`.
    pub fn get_interrupt_call_rate(&mut self, irqnum: u16) -> Result<u32> {
        let dat = self.control_read_exact(Endpoint::InterruptCallRate as u8, irqnum, 0, 4)?;
        Ok(u32::from_le_bytes([dat[0], dat[1], dat[2], dat[3]]))
    }

    pub fn get_microsecond_timer(&mut self) -> Result<u32> {
        let dat = self.control_read_exact(Endpoint::MicrosecondTimer as u8, 0, 0, 4)?;
        Ok(u32::from_le_bytes([dat[0], dat[1], dat[2], dat[3]]))
    }

    /// Set the RTC, one request per field.
    pub fn set_datetime(&mut self, dt: NaiveDateTime) -> Result<()> {
        let fields = [
            (Endpoint::SetRtcYear, dt.year() as u16),
            (Endpoint::SetRtcMonth, dt.month() as u16),
            (Endpoint::SetRtcDay, dt.day() as u16),
            (Endpoint::SetRtcWeekday, dt.weekday().number_from_monday() as u16),
            (Endpoint::SetRtcHour, dt.hour() as u16),
            (Endpoint::SetRtcMinute, dt.minute() as u16),
            (Endpoint::SetRtcSecond, dt.second() as u16),
        ];
        for (endpoint, value) in fields {
            self.control_write(endpoint as u8, value, 0)?;
        }
        Ok(())
    }

    pub fn get_datetime(&mut self) -> Result<NaiveDateTime> {
        let dat = self.control_read_exact(Endpoint::GetDatetime as u8, 0, 0, 8)?;
        let year = u16::from_le_bytes([dat[0], dat[1]]) as i32;

        // dat[4] is the weekday, implied by the date
        NaiveDate::from_ymd_opt(year, dat[2] as u32, dat[3] as u32)
            .and_then(|date| date.and_hms_opt(dat[5] as u32, dat[6] as u32, dat[7] as u32))
            .ok_or(
                crate::panda::error::Error::InvalidResponse {
                    expected: 8,
                    got: dat.len(),
                }
                .into(),
            )
    }

    /// Drop all frames queued for `bus`, or the receive queue with [`CAN_CLEAR_RX_QUEUE`].
    pub fn can_clear(&mut self, bus: u16) -> Result<()> {
        self.control_write(Endpoint::CanClear as u8, bus, 0)
    }

    pub fn can_reset_communications(&mut self) -> Result<()> {
        self.control_write(Endpoint::CanResetCommunications as u8, 0, 0)
    }
}
