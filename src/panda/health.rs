//! Telemetry records returned by the health requests. Both are packed little endian structs.
use bytes::Buf;
use strum_macros::{Display, FromRepr};

use crate::panda::constants::HarnessStatus;
use crate::panda::error::Error;

pub const HEALTH_SIZE: usize = 62;
pub const CAN_HEALTH_SIZE: usize = 64;

/// Last error code of a CAN peripheral.
#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr, Display)]
#[repr(u8)]
pub enum LastErrorCode {
    NoError = 0,
    Stuff = 1,
    Form = 2,
    Ack = 3,
    Bit1 = 4,
    Bit0 = 5,
    Crc = 6,
    NoChange = 7,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Health {
    pub uptime: u32,
    pub voltage: u32,
    pub current: u32,
    pub safety_tx_blocked: u32,
    pub safety_rx_invalid: u32,
    pub tx_buffer_overflow: u32,
    pub rx_buffer_overflow: u32,
    pub gmlan_send_errs: u32,
    pub faults: u32,
    pub ignition_line: u8,
    pub ignition_can: u8,
    pub controls_allowed: u8,
    /// Raw harness status, see [`Health::harness_status`]
    pub car_harness_status: u8,
    pub safety_mode: u8,
    pub safety_param: u16,
    pub fault_status: u8,
    pub power_save_enabled: u8,
    pub heartbeat_lost: u8,
    pub alternative_experience: u16,
    pub interrupt_load: f32,
    pub fan_power: u8,
    pub safety_rx_checks_invalid: u8,
    pub spi_checksum_error_count: u16,
    pub fan_stall_count: u8,
    pub sbu1_voltage_mv: u16,
    pub sbu2_voltage_mv: u16,
    pub som_reset_triggered: u8,
}

impl Health {
    pub fn harness_status(&self) -> Option<HarnessStatus> {
        HarnessStatus::from_repr(self.car_harness_status)
    }
}

impl TryFrom<&[u8]> for Health {
    type Error = Error;

    fn try_from(mut dat: &[u8]) -> Result<Self, Self::Error> {
        if dat.remaining() < HEALTH_SIZE {
            return Err(Error::InvalidResponse {
                expected: HEALTH_SIZE,
                got: dat.remaining(),
            });
        }

        Ok(Health {
            uptime: dat.get_u32_le(),
            voltage: dat.get_u32_le(),
            current: dat.get_u32_le(),
            safety_tx_blocked: dat.get_u32_le(),
            safety_rx_invalid: dat.get_u32_le(),
            tx_buffer_overflow: dat.get_u32_le(),
            rx_buffer_overflow: dat.get_u32_le(),
            gmlan_send_errs: dat.get_u32_le(),
            faults: dat.get_u32_le(),
            ignition_line: dat.get_u8(),
            ignition_can: dat.get_u8(),
            controls_allowed: dat.get_u8(),
            car_harness_status: dat.get_u8(),
            safety_mode: dat.get_u8(),
            safety_param: dat.get_u16_le(),
            fault_status: dat.get_u8(),
            power_save_enabled: dat.get_u8(),
            heartbeat_lost: dat.get_u8(),
            alternative_experience: dat.get_u16_le(),
            interrupt_load: dat.get_f32_le(),
            fan_power: dat.get_u8(),
            safety_rx_checks_invalid: dat.get_u8(),
            spi_checksum_error_count: dat.get_u16_le(),
            fan_stall_count: dat.get_u8(),
            sbu1_voltage_mv: dat.get_u16_le(),
            sbu2_voltage_mv: dat.get_u16_le(),
            som_reset_triggered: dat.get_u8(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanHealth {
    pub bus_off: u8,
    pub bus_off_cnt: u32,
    pub error_warning: u8,
    pub error_passive: u8,
    pub last_error: u8,
    pub last_stored_error: u8,
    pub last_data_error: u8,
    pub last_data_stored_error: u8,
    pub receive_error_cnt: u8,
    pub transmit_error_cnt: u8,
    pub total_error_cnt: u32,
    pub total_tx_lost_cnt: u32,
    pub total_rx_lost_cnt: u32,
    pub total_tx_cnt: u32,
    pub total_rx_cnt: u32,
    pub total_fwd_cnt: u32,
    pub total_tx_checksum_error_cnt: u32,
    pub can_speed: u16,
    pub can_data_speed: u16,
    pub canfd_enabled: u8,
    pub brs_enabled: u8,
    pub canfd_non_iso: u8,
    pub irq0_call_rate: u32,
    pub irq1_call_rate: u32,
    pub irq2_call_rate: u32,
    pub can_core_reset_cnt: u32,
}

impl CanHealth {
    pub fn last_error(&self) -> Option<LastErrorCode> {
        LastErrorCode::from_repr(self.last_error)
    }

    pub fn last_stored_error(&self) -> Option<LastErrorCode> {
        LastErrorCode::from_repr(self.last_stored_error)
    }

    pub fn last_data_error(&self) -> Option<LastErrorCode> {
        LastErrorCode::from_repr(self.last_data_error)
    }

    pub fn last_data_stored_error(&self) -> Option<LastErrorCode> {
        LastErrorCode::from_repr(self.last_data_stored_error)
    }
}

impl TryFrom<&[u8]> for CanHealth {
    type Error = Error;

    fn try_from(mut dat: &[u8]) -> Result<Self, Self::Error> {
        if dat.remaining() < CAN_HEALTH_SIZE {
            return Err(Error::InvalidResponse {
                expected: CAN_HEALTH_SIZE,
                got: dat.remaining(),
            });
        }

        Ok(CanHealth {
            bus_off: dat.get_u8(),
            bus_off_cnt: dat.get_u32_le(),
            error_warning: dat.get_u8(),
            error_passive: dat.get_u8(),
            last_error: dat.get_u8(),
            last_stored_error: dat.get_u8(),
            last_data_error: dat.get_u8(),
            last_data_stored_error: dat.get_u8(),
            receive_error_cnt: dat.get_u8(),
            transmit_error_cnt: dat.get_u8(),
            total_error_cnt: dat.get_u32_le(),
            total_tx_lost_cnt: dat.get_u32_le(),
            total_rx_lost_cnt: dat.get_u32_le(),
            total_tx_cnt: dat.get_u32_le(),
            total_rx_cnt: dat.get_u32_le(),
            total_fwd_cnt: dat.get_u32_le(),
            total_tx_checksum_error_cnt: dat.get_u32_le(),
            can_speed: dat.get_u16_le(),
            can_data_speed: dat.get_u16_le(),
            canfd_enabled: dat.get_u8(),
            brs_enabled: dat.get_u8(),
            canfd_non_iso: dat.get_u8(),
            irq0_call_rate: dat.get_u32_le(),
            irq1_call_rate: dat.get_u32_le(),
            irq2_call_rate: dat.get_u32_le(),
            can_core_reset_cnt: dat.get_u32_le(),
        })
    }
}
