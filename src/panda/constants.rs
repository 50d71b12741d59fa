use strum_macros::{Display, FromRepr};

use crate::panda::mcu::McuType;

pub const VENDOR_ID: u16 = 0xbbaa;
pub const PRODUCT_ID: u16 = 0xddcc;
pub const PRODUCT_ID_BOOTSTUB: u16 = 0xddee;
pub const PRODUCT_IDS: [u16; 2] = [PRODUCT_ID, PRODUCT_ID_BOOTSTUB];

/// Packet layouts this library understands. The firmware reports its own through [`Endpoint::PacketsVersions`].
pub const HEALTH_PACKET_VERSION: u8 = 14;
pub const CAN_PACKET_VERSION: u8 = 4;
pub const CAN_HEALTH_PACKET_VERSION: u8 = 5;

/// Signature word returned by the flasher probe in the bootstub.
pub const FLASHER_SIGNATURE: [u8; 4] = [0xde, 0xad, 0xd0, 0x0d];

/// An old bootstub answers the hardware type request with the flasher probe reply.
pub const MISSING_HW_TYPE_SIGNATURE: [u8; 8] = [0xff, 0x00, 0xc1, 0x3e, 0xde, 0xad, 0xd0, 0x0d];

/// bcdDevice value of bootstubs that predate the hardware type in the descriptor.
pub const BCD_DEVICE_NO_HW_TYPE: u16 = 0x2300;

#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr, Display)]
#[repr(u8)]
pub enum HwType {
    Unknown = 0x0,
    WhitePanda = 0x1,
    GreyPanda = 0x2,
    BlackPanda = 0x3,
    Pedal = 0x4,
    Uno = 0x5,
    Dos = 0x6,
    RedPanda = 0x7,
    RedPandaV2 = 0x8,
    Tres = 0x9,
}

impl HwType {
    /// MCU family the board is built around. `None` for [`HwType::Unknown`].
    pub fn mcu_type(&self) -> Option<McuType> {
        match self {
            HwType::Pedal => Some(McuType::F2),
            HwType::WhitePanda
            | HwType::GreyPanda
            | HwType::BlackPanda
            | HwType::Uno
            | HwType::Dos => Some(McuType::F4),
            HwType::RedPanda | HwType::RedPandaV2 | HwType::Tres => Some(McuType::H7),
            HwType::Unknown => None,
        }
    }

    pub fn has_obd(&self) -> bool {
        matches!(
            self,
            HwType::BlackPanda
                | HwType::Uno
                | HwType::Dos
                | HwType::RedPanda
                | HwType::RedPandaV2
                | HwType::Tres
        )
    }
}

pub const FD_PANDAS: [HwType; 3] = [HwType::RedPanda, HwType::RedPandaV2, HwType::Tres];

/// Vendor requests understood by the application firmware.
#[derive(Debug, Copy, Clone)]
#[repr(u8)]
pub enum Endpoint {
    GetDatetime = 0xa0,
    SetRtcYear = 0xa1,
    SetRtcMonth = 0xa2,
    SetRtcDay = 0xa3,
    SetRtcWeekday = 0xa4,
    SetRtcHour = 0xa5,
    SetRtcMinute = 0xa6,
    SetRtcSecond = 0xa7,
    MicrosecondTimer = 0xa8,
    IrPower = 0xb0,
    FanPower = 0xb1,
    FanRpm = 0xb2,
    CanResetCommunications = 0xc0,
    HwType = 0xc1,
    CanHealth = 0xc2,
    Uid = 0xc3,
    InterruptCallRate = 0xc4,
    Relay = 0xc5,
    SomGpio = 0xc6,
    Obd = 0xdb,
    SafetyModel = 0xdc,
    PacketsVersions = 0xdd,
    CanSpeed = 0xde,
    SerialRead = 0xe0,
    UartParity = 0xe2,
    UartCallback = 0xe3,
    UartBaud = 0xe4,
    Loopback = 0xe5,
    ClockSourcePeriod = 0xe6,
    PowerSave = 0xe7,
    KLineWakeup = 0xf0,
    CanClear = 0xf1,
    SerialClear = 0xf2,
    Heartbeat = 0xf3,
    KLine5Baud = 0xf4,
    Siren = 0xf6,
    GreenLed = 0xf7,
    HeartbeatDisabled = 0xf8,
    CanDataSpeed = 0xf9,
    Deepsleep = 0xfb,
    CanFdNonIso = 0xfc,
    Serial = 0xd0,
    Reset = 0xd1,
    Health = 0xd2,
    SignatureLow = 0xd3,
    SignatureHigh = 0xd4,
    Version = 0xd6,
    ResetDevice = 0xd8,
}

/// Vendor requests understood by the bootstub. They reuse numbers of the application.
#[derive(Debug, Copy, Clone)]
#[repr(u8)]
pub enum BootstubEndpoint {
    FlasherProbe = 0xb0,
    Unlock = 0xb1,
    EraseSector = 0xb2,
}

/// wValue of [`Endpoint::Reset`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum ResetMode {
    EnterBootloader = 0,
    EnterBootstub = 1,
}

/// Bulk endpoints, numbered without the direction bit.
#[derive(Debug, Copy, Clone)]
#[repr(u8)]
pub enum BulkEndpoint {
    CanRead = 1,
    Serial = 2,
    CanWrite = 3,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr, Display)]
#[repr(u16)]
pub enum SafetyModel {
    Silent = 0,
    HondaNidec = 1,
    Toyota = 2,
    Elm327 = 3,
    Gm = 4,
    HondaBoschGiraffe = 5,
    Ford = 6,
    Hyundai = 8,
    Chrysler = 9,
    Tesla = 10,
    Subaru = 11,
    Mazda = 13,
    Nissan = 14,
    VolkswagenMqb = 15,
    AllOutput = 17,
    GmAscm = 18,
    NoOutput = 19,
    HondaBosch = 20,
    VolkswagenPq = 21,
    SubaruPreglobal = 22,
    HyundaiLegacy = 23,
    HyundaiCommunity = 24,
    Stellantis = 25,
    Faw = 26,
    Body = 27,
    HyundaiCanfd = 28,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr, Display)]
#[repr(u8)]
pub enum HarnessStatus {
    NotConnected = 0,
    Normal = 1,
    Flipped = 2,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum SerialPort {
    Debug = 0,
    Esp = 1,
    Lin1 = 2,
    Lin2 = 3,
    SomDebug = 4,
}
