//! Flash layout of the STM32 families used on pandas.
use std::path::{Path, PathBuf};

use strum_macros::{Display, EnumIter};

use crate::panda::error::Error;

/// Index of the last sector the flasher may erase. The one after it holds provisioning data.
pub const MAX_APP_SECTOR: usize = 6;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, EnumIter, Display)]
pub enum McuType {
    F2,
    F4,
    H7,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct McuConfig {
    pub mcu: &'static str,
    /// Chip id as reported by the ST bootloader.
    pub mcu_idcode: u16,
    pub sector_sizes: &'static [usize],
    pub uid_address: u32,
    /// Programming granularity used by the DFU bootloader.
    pub block_size: usize,
    pub serial_number_address: u32,
    pub app_address: u32,
    pub bootstub_address: u32,
    pub app_fn: &'static str,
    pub bootstub_fn: &'static str,
}

const FX_SECTOR_SIZES_F2: [usize; 12] = [
    0x4000, 0x4000, 0x4000, 0x4000, 0x10000, 0x20000, 0x20000, 0x20000, 0x20000, 0x20000, 0x20000,
    0x20000,
];
const FX_SECTOR_SIZES_F4: [usize; 16] = [
    0x4000, 0x4000, 0x4000, 0x4000, 0x10000, 0x20000, 0x20000, 0x20000, 0x20000, 0x20000, 0x20000,
    0x20000, 0x20000, 0x20000, 0x20000, 0x20000,
];
const H7_SECTOR_SIZES: [usize; 7] = [0x20000; 7];

static F2_CONFIG: McuConfig = McuConfig {
    mcu: "STM32F2",
    mcu_idcode: 0x411,
    sector_sizes: &FX_SECTOR_SIZES_F2,
    uid_address: 0x1FFF7A10,
    block_size: 0x800,
    serial_number_address: 0x1FFF79C0,
    app_address: 0x8004000,
    bootstub_address: 0x8000000,
    app_fn: "panda.bin.signed",
    bootstub_fn: "bootstub.panda.bin",
};

static F4_CONFIG: McuConfig = McuConfig {
    mcu: "STM32F4",
    mcu_idcode: 0x463,
    sector_sizes: &FX_SECTOR_SIZES_F4,
    uid_address: 0x1FFF7A10,
    block_size: 0x800,
    serial_number_address: 0x1FFF79C0,
    app_address: 0x8004000,
    bootstub_address: 0x8000000,
    app_fn: "panda.bin.signed",
    bootstub_fn: "bootstub.panda.bin",
};

static H7_CONFIG: McuConfig = McuConfig {
    mcu: "STM32H7",
    mcu_idcode: 0x483,
    sector_sizes: &H7_SECTOR_SIZES,
    uid_address: 0x1FF1E800,
    block_size: 0x400,
    serial_number_address: 0x080FFFE0,
    app_address: 0x8020000,
    bootstub_address: 0x8000000,
    app_fn: "panda_h7.bin.signed",
    bootstub_fn: "bootstub.panda_h7.bin",
};

impl McuType {
    pub fn config(&self) -> &'static McuConfig {
        match self {
            McuType::F2 => &F2_CONFIG,
            McuType::F4 => &F4_CONFIG,
            McuType::H7 => &H7_CONFIG,
        }
    }

    pub fn from_idcode(idcode: u16) -> Option<McuType> {
        use strum::IntoEnumIterator;
        McuType::iter().find(|mcu| mcu.config().mcu_idcode == idcode)
    }
}

impl McuConfig {
    pub fn sector_count(&self) -> usize {
        self.sector_sizes.len()
    }

    /// Start address of sector `i`.
    pub fn sector_address(&self, i: usize) -> u32 {
        let offset: usize = self.sector_sizes.iter().take(i).sum();
        self.bootstub_address + offset as u32
    }

    pub fn app_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.app_fn)
    }

    pub fn bootstub_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.bootstub_fn)
    }

    /// Last sector that has to be erased to fit an application image of `len` bytes. The image starts at sector 1.
    pub fn last_sector(&self, len: usize) -> Result<usize, Error> {
        let mut total = 0;
        for (i, size) in self.sector_sizes.iter().enumerate().skip(1) {
            total += size;
            if total > len {
                return match i {
                    i if i <= MAX_APP_SECTOR => Ok(i),
                    _ => Err(Error::FlashGeometry { len }),
                };
            }
        }
        Err(Error::FlashGeometry { len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn sector_counts() {
        assert_eq!(McuType::F2.config().sector_count(), 12);
        assert_eq!(McuType::F4.config().sector_count(), 16);
        assert_eq!(McuType::H7.config().sector_count(), 7);
        for mcu in McuType::iter() {
            let config = mcu.config();
            assert!(config.app_address > config.bootstub_address);
        }
    }

    #[test]
    fn app_starts_at_sector_one() {
        for mcu in McuType::iter() {
            let config = mcu.config();
            assert_eq!(config.sector_address(0), config.bootstub_address);
            assert_eq!(config.sector_address(1), config.app_address);
        }
    }

    #[test]
    fn idcode_lookup() {
        assert_eq!(McuType::from_idcode(0x463), Some(McuType::F4));
        assert_eq!(McuType::from_idcode(0x483), Some(McuType::H7));
        assert_eq!(McuType::from_idcode(0x123), None);
    }

    #[test]
    fn geometry_f4() {
        let config = McuType::F4.config();
        assert_eq!(config.last_sector(0), Ok(1));
        assert_eq!(config.last_sector(0x4000 - 1), Ok(1));
        assert_eq!(config.last_sector(0x4000), Ok(2));
        assert_eq!(config.last_sector(300 * 1024), Ok(6));

        // Would need sector 7
        assert_eq!(
            config.last_sector(400 * 1024),
            Err(Error::FlashGeometry { len: 400 * 1024 })
        );
    }

    #[test]
    fn geometry_h7() {
        let config = McuType::H7.config();
        assert_eq!(config.last_sector(0x20000 * 6 - 1), Ok(6));

        // Bigger than all sectors combined
        assert_eq!(
            config.last_sector(0x20000 * 6),
            Err(Error::FlashGeometry { len: 0x20000 * 6 })
        );
    }

    #[test]
    fn accepted_images_fit() {
        for mcu in McuType::iter() {
            let config = mcu.config();
            for len in (0..0x100000).step_by(0x1000) {
                if let Ok(last) = config.last_sector(len) {
                    let total: usize = config.sector_sizes[..=last].iter().sum();
                    assert!(total > len);
                    assert!(last <= MAX_APP_SECTOR);
                }
            }
        }
    }
}
