//! Target detection (C6): CoreID -> CPUID -> IDCODE -> flash-size register -> catalog lookup ->
//! variant filter -> flash-driver selection.

use crate::catalog::{Catalog, CoreRecord, DeviceRecord, VariantRecord};
use crate::cpu::Stm32Cpu;
use crate::error::{Error, Result};
use crate::usb::Transport;

const CPUID_ADDR: u32 = 0xe000_ed00;

/// The outcome of a successful detection: the catalog entries that matched, the measured flash
/// size, the (possibly filtered) variant set, and the worst-case SRAM/EEPROM reported for it.
pub struct DetectedTarget {
    pub core: CoreRecord,
    pub device: DeviceRecord,
    pub flash_size_kb: u16,
    pub variants: Vec<VariantRecord>,
    pub sram_kb: u16,
    pub eeprom_kb: u16,
}

/// Runs the CoreID -> CPUID -> IDCODE -> flash-size -> catalog chain and logs the detection
/// banner (CORE/MCU/FLASH/SRAM/EEPROM), mirroring the original tool's `find_mcu_info`.
pub fn detect<T: Transport>(
    cpu: &mut Stm32Cpu<T>,
    catalog: &Catalog,
    expected_type: Option<&str>,
) -> Result<DetectedTarget> {
    let expected_type = expected_type.map(clean_mcu_type).transpose()?;

    let coreid = cpu.stlink.read_coreid()?;
    if coreid == 0 {
        return Err(Error::NotConnected);
    }
    cpu.progress.info(&format!("coreid: {:#010x}", coreid));

    let cpuid = cpu.stlink.get_debugreg32(CPUID_ADDR)?;
    let part_no = ((cpuid >> 4) & 0xfff) as u16;
    cpu.progress
        .info(&format!("cpuid: {:#010x} (part_no {:#05x})", cpuid, part_no));
    let core = catalog.find_core(part_no).cloned().ok_or_else(|| {
        Error::Unsupported(format!("part_no {:#05x} is not supported", part_no))
    })?;
    cpu.progress.info(&format!("CORE: {}", core.core));

    let mut dev_id = None;
    for &addr in &core.idcode_reg {
        let idcode = cpu.stlink.get_debugreg32(addr)?;
        let candidate = (idcode & 0xfff) as u16;
        if candidate != 0 && core.find_device(candidate).is_some() {
            dev_id = Some(candidate);
            break;
        }
    }
    let dev_id = dev_id
        .ok_or_else(|| Error::Unsupported("no IDCODE candidate matched a known dev_id".into()))?;
    cpu.progress.info(&format!("dev_id: {:#05x}", dev_id));
    let device = core.find_device(dev_id).cloned().unwrap();

    let flash_size_kb = cpu.stlink.get_debugreg16(device.flash_size_reg)?;

    let all_matching: Vec<VariantRecord> = device
        .variants
        .iter()
        .filter(|v| v.flash_size_kb == flash_size_kb)
        .cloned()
        .collect();
    if all_matching.is_empty() {
        return Err(Error::Unsupported(format!(
            "dev_id {:#05x} with FLASH size {}KB is not supported",
            dev_id, flash_size_kb
        )));
    }

    let variants = if let Some(pattern) = &expected_type {
        let filtered: Vec<VariantRecord> = all_matching
            .iter()
            .filter(|v| v.type_name.to_ascii_uppercase().starts_with(pattern.as_str()))
            .cloned()
            .collect();
        if filtered.is_empty() {
            let known: Vec<&str> = all_matching.iter().map(|v| v.type_name.as_str()).collect();
            return Err(Error::Unsupported(format!(
                "connected CPU is not {} but one of: {}",
                pattern,
                known.join(",")
            )));
        }
        filtered
    } else {
        all_matching
    };

    let sram_min = variants.iter().map(|v| v.sram_kb).min().unwrap();
    let sram_max = variants.iter().map(|v| v.sram_kb).max().unwrap();
    let eeprom_min = variants.iter().map(|v| v.eeprom_kb).min().unwrap();
    let eeprom_max = variants.iter().map(|v| v.eeprom_kb).max().unwrap();
    if sram_min != sram_max {
        cpu.progress.warning("detected CPUs have different SRAM sizes");
    }
    if eeprom_min != eeprom_max {
        cpu.progress.warning("detected CPUs have different EEPROM sizes");
    }

    let type_names: Vec<&str> = variants.iter().map(|v| v.type_name.as_str()).collect();
    cpu.progress.info(&format!("MCU: {}", type_names.join("/")));
    cpu.progress.info(&format!("FLASH: {}KB", flash_size_kb));
    cpu.progress.info(&format!("SRAM: {}KB", sram_min));
    cpu.progress.info(&format!("EEPROM: {}KB", eeprom_min));

    Ok(DetectedTarget {
        core,
        device,
        flash_size_kb,
        variants,
        sram_kb: sram_min,
        eeprom_kb: eeprom_min,
    })
}

/// Uppercases `s`, requires it to start with "STM32" (`BadParam` otherwise), and masks the
/// package-code character at position 9 with 'X' when present, so e.g. "stm32f103rct6" and
/// "STM32F103RXX6" both narrow the catalog to the same "STM32F103RX" prefix family. Idempotent:
/// applying it a second time to its own output returns the same string.
pub fn clean_mcu_type(s: &str) -> Result<String> {
    let upper = s.to_ascii_uppercase();
    if !upper.starts_with("STM32") {
        return Err(Error::BadParam(format!(
            "selected CPU type '{}' is not STM32",
            s
        )));
    }
    if upper.len() > 9 {
        let mut bytes = upper.into_bytes();
        bytes[9] = b'X';
        Ok(String::from_utf8(bytes).expect("ascii-only by construction"))
    } else {
        Ok(upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::progress::NullProgress;
    use crate::stlink::StlinkDriver;
    use crate::test_support::MockTransport;
    use crate::usb::ProbeVariant;

    #[test]
    fn clean_mcu_type_rejects_non_stm32() {
        assert!(clean_mcu_type("AT91SAM").is_err());
    }

    #[test]
    fn clean_mcu_type_masks_package_code_and_is_idempotent() {
        let once = clean_mcu_type("stm32f103rct6").unwrap();
        assert_eq!(once, "STM32F103XCT6");
        let twice = clean_mcu_type(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn clean_mcu_type_short_string_is_left_alone_besides_case() {
        assert_eq!(clean_mcu_type("stm32f1").unwrap(), "STM32F1");
    }

    #[test]
    fn detect_fails_not_connected_on_zero_coreid() {
        let mut t = MockTransport::new(ProbeVariant::V2);
        t.push_response([0u8; 4]); // read_coreid -> 0
        let mut stlink = StlinkDriver::new(t);
        let progress = NullProgress;
        let mut cpu = Stm32Cpu::new(&mut stlink, &progress);
        let catalog = Catalog::builtin();

        let err = detect(&mut cpu, &catalog, None).unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[test]
    fn detect_fails_unsupported_on_unknown_part_no() {
        let mut t = MockTransport::new(ProbeVariant::V2);
        t.push_response([0x01, 0, 0, 0]); // coreid != 0
        let mut cpuid_resp = [0u8; 8];
        crate::endian::write_u32_le(&mut cpuid_resp[4..8], 0xffff_0000);
        t.push_response(cpuid_resp); // cpuid -> part_no 0xfff0, unknown
        let mut stlink = StlinkDriver::new(t);
        let progress = NullProgress;
        let mut cpu = Stm32Cpu::new(&mut stlink, &progress);
        let catalog = Catalog::builtin();

        let err = detect(&mut cpu, &catalog, None).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
