//! The MCU catalog: CPUID part numbers -> ID-CODE device ids -> per-chip RAM/flash sizes and a
//! flash-driver tag. Treated by [`crate::detect`] as an external collaborator (§1) — this module
//! ships a small, real table sufficient to exercise every branch of [`crate::flash`] and
//! [`crate::detect`], not the full upstream device list.

/// A single known variant of a device: its marketing type string and resource sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRecord {
    pub type_name: String,
    pub flash_size_kb: u16,
    pub sram_kb: u16,
    pub eeprom_kb: u16,
}

/// A device family sharing an IDCODE device id, flash-size register, and flash driver.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub dev_id: u16,
    pub flash_size_reg: u32,
    pub flash_driver: String,
    /// Erase geometry: page or sector sizes in bytes, in address order from FLASH_START.
    pub erase_sizes: Vec<u32>,
    pub variants: Vec<VariantRecord>,
}

/// A Cortex-M core generation, keyed by the CPUID part number field.
#[derive(Debug, Clone)]
pub struct CoreRecord {
    pub part_no: u16,
    pub core: String,
    /// One or more candidate addresses for the IDCODE register; the first non-zero dev_id wins.
    pub idcode_reg: Vec<u32>,
    pub devices: Vec<DeviceRecord>,
}

/// An ordered list of [`CoreRecord`]s, consulted by [`crate::detect::detect`].
pub struct Catalog {
    pub cores: Vec<CoreRecord>,
}

impl Catalog {
    /// A small, hand-picked set of real STM32 parts covering each flash family this crate
    /// drives: a single-bank page-family part, a dual-bank ("XL") page-family part, and a
    /// sector-family part. See the design notes for why this isn't the full device list.
    pub fn builtin() -> Catalog {
        Catalog {
            cores: vec![
                // Cortex-M0, STM32F05x family, page erase, single bank.
                CoreRecord {
                    part_no: 0x0c20,
                    core: "Cortex-M0".into(),
                    idcode_reg: vec![0x4001_5800],
                    devices: vec![DeviceRecord {
                        dev_id: 0x440,
                        flash_size_reg: 0x1fff_f7cc,
                        flash_driver: "FP".into(),
                        erase_sizes: vec![1024],
                        variants: vec![VariantRecord {
                            type_name: "STM32F051x8".into(),
                            flash_size_kb: 64,
                            sram_kb: 8,
                            eeprom_kb: 0,
                        }],
                    }],
                },
                // Cortex-M3, STM32F10x XL-density family, page erase, dual bank.
                CoreRecord {
                    part_no: 0x0c23,
                    core: "Cortex-M3".into(),
                    idcode_reg: vec![0xe004_2000],
                    devices: vec![DeviceRecord {
                        dev_id: 0x430,
                        flash_size_reg: 0x1fff_f7e0,
                        flash_driver: "FPXL".into(),
                        erase_sizes: vec![2048],
                        variants: vec![VariantRecord {
                            type_name: "STM32F103xG".into(),
                            flash_size_kb: 1024,
                            sram_kb: 96,
                            eeprom_kb: 0,
                        }],
                    }],
                },
                // Cortex-M4, STM32F40x family, sector erase.
                CoreRecord {
                    part_no: 0x0c24,
                    core: "Cortex-M4".into(),
                    idcode_reg: vec![0xe004_2000],
                    devices: vec![DeviceRecord {
                        dev_id: 0x413,
                        flash_size_reg: 0x1fff_7a22,
                        flash_driver: "FS".into(),
                        erase_sizes: vec![
                            16 * 1024,
                            16 * 1024,
                            16 * 1024,
                            16 * 1024,
                            64 * 1024,
                            128 * 1024,
                            128 * 1024,
                            128 * 1024,
                        ],
                        variants: vec![VariantRecord {
                            type_name: "STM32F407xG".into(),
                            flash_size_kb: 1024,
                            sram_kb: 192,
                            eeprom_kb: 0,
                        }],
                    }],
                },
            ],
        }
    }

    pub fn find_core(&self, part_no: u16) -> Option<&CoreRecord> {
        self.cores.iter().find(|c| c.part_no == part_no)
    }
}

impl CoreRecord {
    pub fn find_device(&self, dev_id: u16) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.dev_id == dev_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_covers_all_three_flash_families() {
        let catalog = Catalog::builtin();
        let drivers: Vec<&str> = catalog
            .cores
            .iter()
            .flat_map(|c| c.devices.iter())
            .map(|d| d.flash_driver.as_str())
            .collect();
        assert!(drivers.contains(&"FP"));
        assert!(drivers.contains(&"FPXL"));
        assert!(drivers.contains(&"FS"));
    }

    #[test]
    fn find_core_is_keyed_by_part_no() {
        let catalog = Catalog::builtin();
        assert!(catalog.find_core(0x0c20).is_some());
        assert!(catalog.find_core(0xffff).is_none());
    }
}
