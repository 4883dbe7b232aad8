//! Sector-erase flash family (C5): STM32F2/F4-class devices, register bank at 0x4002_3c00.
//!
//! Program parallelism (PSIZE) is chosen once, at construction, from the measured target
//! voltage; lower voltage means a narrower store width and a longer worst-case erase time.

use std::time::Duration;

use crate::cpu::Stm32Cpu;
use crate::error::{Error, Result};
use crate::stlink::MAX_TRANSFER;
use crate::usb::Transport;

use super::{is_blank, pad_to_word, stage_and_run_stub, wait_for_breakpoint, FlashDriver};

const BANK_BASE: u32 = 0x4002_3c00;
const KEYR: u32 = BANK_BASE + 0x04;
const SR: u32 = BANK_BASE + 0x0c;
const CR: u32 = BANK_BASE + 0x10;

const CR_PG: u32 = 0x01;
const CR_SER: u32 = 0x02;
const CR_MER: u32 = 0x04;
const CR_STRT: u32 = 0x0001_0000;
const CR_LOCK: u32 = 0x8000_0000;
const CR_SNB_SHIFT: u32 = 3;

const SR_BUSY: u32 = 0x0001_0000;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xcdef_89ab;

/// Program-unit width selected by supply voltage, from highest to lowest band.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriterVariant {
    Word,     // PSIZE x32, >= 2.7V
    Halfword, // PSIZE x16, >= 2.1V
    Byte,     // PSIZE x8,  >= 1.8V (strictly above)
}

impl WriterVariant {
    fn psize_bits(self) -> u32 {
        match self {
            WriterVariant::Word => 0x0200,
            WriterVariant::Halfword => 0x0100,
            WriterVariant::Byte => 0x0000,
        }
    }

    fn unit_bytes(self) -> u32 {
        match self {
            WriterVariant::Word => 4,
            WriterVariant::Halfword => 2,
            WriterVariant::Byte => 1,
        }
    }

    fn stub(self) -> &'static [u8] {
        match self {
            WriterVariant::Word => WRITER_STUB_WORD,
            WriterVariant::Halfword => WRITER_STUB_HALFWORD,
            WriterVariant::Byte => WRITER_STUB_BYTE,
        }
    }

    /// Worst-case mass-erase time at this band, before the 1.5x safety scaling.
    fn mass_erase_nominal(self) -> Duration {
        match self {
            WriterVariant::Word => Duration::from_secs(16),
            WriterVariant::Halfword => Duration::from_secs(22),
            WriterVariant::Byte => Duration::from_secs(32),
        }
    }
}

/// Selects a band for `voltage`, per the closed, strict-inequality boundary table. Below the
/// lowest band (`<= 1.8V`) flash program/erase isn't possible at all.
fn select_band(voltage: f64) -> Result<WriterVariant> {
    if voltage > 2.7 {
        Ok(WriterVariant::Word)
    } else if voltage > 2.1 {
        Ok(WriterVariant::Halfword)
    } else if voltage > 1.8 {
        Ok(WriterVariant::Byte)
    } else {
        Err(Error::FlashVoltage { voltage })
    }
}

/// Opaque Thumb writer stubs, one per PSIZE: copy R2 units from [R0] to [R1] at the unit width
/// implied by the variant, spinning on SR.BUSY (R5 mask), checking SR==0 for completion, then
/// `bkpt 0x00`. The host chooses which one to stage based on the measured supply voltage.
#[rustfmt::skip]
const WRITER_STUB_WORD: &[u8] = &[
    0x03, 0x68, // ldr  r3, [r0, #0]
    0x0b, 0x60, // str  r3, [r1, #0]
    // test_busy:
    0x23, 0x68, // ldr  r3, [r4, #0]
    0x2b, 0x42, // tst  r3, r5
    0xfc, 0xd1, // bne  <test_busy>
    0x00, 0x2b, // cmp  r3, #0
    0x04, 0xd1, // bne  <exit>
    0x04, 0x30, // adds r0, #4
    0x04, 0x31, // adds r1, #4
    0x04, 0x3a, // subs r2, #4
    0x00, 0x2a, // cmp  r2, #0
    0xf3, 0xd1, // bne  <write>
    // exit:
    0x00, 0xbe, // bkpt 0x00
];
#[rustfmt::skip]
const WRITER_STUB_HALFWORD: &[u8] = &[
    0x03, 0x88, // ldrh r3, [r0, #0]
    0x0b, 0x80, // strh r3, [r1, #0]
    // test_busy:
    0x23, 0x68, // ldr  r3, [r4, #0]
    0x2b, 0x42, // tst  r3, r5
    0xfc, 0xd1, // bne  <test_busy>
    0x00, 0x2b, // cmp  r3, #0
    0x04, 0xd1, // bne  <exit>
    0x02, 0x30, // adds r0, #2
    0x02, 0x31, // adds r1, #2
    0x02, 0x3a, // subs r2, #2
    0x00, 0x2a, // cmp  r2, #0
    0xf3, 0xd1, // bne  <write>
    // exit:
    0x00, 0xbe, // bkpt 0x00
];
#[rustfmt::skip]
const WRITER_STUB_BYTE: &[u8] = &[
    0x03, 0x78, // ldrb r3, [r0, #0]
    0x0b, 0x70, // strb r3, [r1, #0]
    // test_busy:
    0x23, 0x68, // ldr  r3, [r4, #0]
    0x2b, 0x42, // tst  r3, r5
    0xfc, 0xd1, // bne  <test_busy>
    0x00, 0x2b, // cmp  r3, #0
    0x04, 0xd1, // bne  <exit>
    0x01, 0x30, // adds r0, #1
    0x01, 0x31, // adds r1, #1
    0x01, 0x3a, // subs r2, #1
    0x00, 0x2a, // cmp  r2, #0
    0xf3, 0xd1, // bne  <write>
    // exit:
    0x00, 0xbe, // bkpt 0x00
];

const STUB_DEADLINE: Duration = Duration::from_millis(200);

pub struct FsDriver<'a, T: Transport> {
    cpu: Stm32Cpu<'a, T>,
    /// Sector sizes in bytes, in address order starting at FLASH_START.
    erase_sizes: Vec<u32>,
    variant: WriterVariant,
}

impl<'a, T: Transport> FsDriver<'a, T> {
    /// Reads the target voltage via the underlying driver and picks the program/erase band.
    pub fn new(mut cpu: Stm32Cpu<'a, T>, erase_sizes: Vec<u32>) -> Result<Self> {
        let voltage = cpu.stlink.target_voltage()?;
        let variant = select_band(voltage)?;
        Ok(FsDriver {
            cpu,
            erase_sizes,
            variant,
        })
    }

    fn unlock(&mut self) -> Result<()> {
        self.cpu.reset_halt()?;
        // two dummy CR reads to settle the peripheral, as the sector family requires
        let _ = self.cpu.stlink.get_debugreg32(CR)?;
        let cr_val = self.cpu.stlink.get_debugreg32(CR)?;
        if cr_val & CR_LOCK != 0 {
            self.cpu.stlink.set_debugreg32(KEYR, KEY1)?;
            self.cpu.stlink.set_debugreg32(KEYR, KEY2)?;
            let cr_val = self.cpu.stlink.get_debugreg32(CR)?;
            if cr_val & CR_LOCK != 0 {
                return Err(Error::FlashLock);
            }
        }
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        let cr_val = self.cpu.stlink.get_debugreg32(CR)?;
        self.cpu.stlink.set_debugreg32(CR, cr_val | CR_LOCK)?;
        self.cpu.reset_halt()
    }

    fn poll_busy(&mut self, deadline: Duration) -> Result<u32> {
        let start = std::time::Instant::now();
        loop {
            let sr = self.cpu.stlink.get_debugreg32(SR)?;
            if sr & SR_BUSY == 0 {
                return Ok(sr);
            }
            if start.elapsed() > deadline {
                return Err(Error::Timeout("sector flash SR.BUSY"));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Worst-case erase time for `sector_size_bytes`, scaled from the 16KB/2.7V reference point
    /// to this driver's band and the sector's actual size, then given the 1.5x safety margin.
    fn sector_erase_deadline(&self, sector_size_bytes: u32) -> Duration {
        let reference_kb = 16.0;
        let reference_s = match self.variant {
            WriterVariant::Word => 0.5,
            WriterVariant::Halfword => 0.75,
            WriterVariant::Byte => 1.1,
        };
        let sector_kb = sector_size_bytes as f64 / 1024.0;
        let nominal = reference_s * (sector_kb / reference_kb).max(1.0);
        Duration::from_secs_f64(nominal * 1.5)
    }

    fn erase_sector(&mut self, index: u32, size_bytes: u32) -> Result<()> {
        let psize = self.variant.psize_bits();
        self.cpu
            .stlink
            .set_debugreg32(CR, CR_SER | psize | (index << CR_SNB_SHIFT))?;
        self.cpu.stlink.set_debugreg32(CR, CR_SER | CR_STRT)?;
        let deadline = self.sector_erase_deadline(size_bytes);
        let sr_val = self.poll_busy(deadline)?;
        if sr_val != 0 {
            return Err(Error::FlashProgram { status: sr_val });
        }
        Ok(())
    }

    fn program_block(&mut self, addr: u32, block: &[u8], verify: bool) -> Result<()> {
        if is_blank(block) {
            return Ok(());
        }
        stage_and_run_stub(&mut self.cpu, self.variant.stub(), block, addr, SR, SR_BUSY, 0)?;
        wait_for_breakpoint(&mut self.cpu, STUB_DEADLINE)?;

        let sr_val = self.cpu.stlink.get_debugreg32(SR)?;
        if sr_val != 0 {
            return Err(Error::FlashProgram { status: sr_val });
        }

        if verify {
            let readback = self.cpu.get_mem(addr, block.len())?;
            if readback != block {
                return Err(Error::VerifyMismatch { addr });
            }
        }
        Ok(())
    }
}

impl<'a, T: Transport> FlashDriver for FsDriver<'a, T> {
    fn mass_erase(&mut self) -> Result<()> {
        self.unlock()?;
        let psize = self.variant.psize_bits();
        self.cpu.stlink.set_debugreg32(CR, CR_MER | psize)?;
        self.cpu.stlink.set_debugreg32(CR, CR_MER | CR_STRT)?;
        let deadline_nominal = self.variant.mass_erase_nominal();
        let deadline = Duration::from_secs_f64(deadline_nominal.as_secs_f64() * 1.5);
        let sr_val = self.poll_busy(deadline)?;
        if sr_val != 0 {
            return Err(Error::FlashProgram { status: sr_val });
        }
        self.lock()
    }

    fn erase_range(&mut self, addr: u32, size: usize) -> Result<()> {
        self.unlock()?;
        let end = addr + size as u32;
        let sector_sizes = self.erase_sizes.clone();
        let mut sector_start = crate::cpu::FLASH_START;
        for (index, sector_size) in sector_sizes.iter().enumerate() {
            if sector_start >= end {
                break;
            }
            let sector_end = sector_start + sector_size;
            if sector_end > addr && sector_start < end {
                self.erase_sector(index as u32, *sector_size)?;
            }
            sector_start = sector_end;
        }
        self.lock()
    }

    fn program(&mut self, addr: u32, data: &[u8], verify: bool) -> Result<()> {
        self.unlock()?;
        self.cpu.stlink.set_debugreg32(CR, CR_PG | self.variant.psize_bits())?;

        let padded = pad_to_word(data);
        let unit = self.variant.unit_bytes();
        let mut offset = 0usize;
        while offset < padded.len() {
            let max_block = (MAX_TRANSFER as u32 / unit * unit) as usize;
            let block_len = std::cmp::min(max_block, padded.len() - offset);
            let block = &padded[offset..offset + block_len];
            self.program_block(addr + offset as u32, block, verify)?;
            offset += block_len;
        }

        self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_band_boundary_is_strict() {
        assert_eq!(select_band(2.71).unwrap(), WriterVariant::Word);
        assert_eq!(select_band(2.7).unwrap(), WriterVariant::Halfword);
        assert_eq!(select_band(2.11).unwrap(), WriterVariant::Halfword);
        assert_eq!(select_band(2.1).unwrap(), WriterVariant::Byte);
        assert_eq!(select_band(1.81).unwrap(), WriterVariant::Byte);
        assert!(select_band(1.8).is_err());
        assert!(select_band(1.0).is_err());
    }

    #[test]
    fn band_30v_selects_word_store_with_expected_sector_deadline() {
        let variant = select_band(3.0).unwrap();
        assert_eq!(variant, WriterVariant::Word);
        assert_eq!(variant.unit_bytes(), 4);
    }

    #[test]
    fn psize_bits_match_the_register_encoding() {
        assert_eq!(WriterVariant::Word.psize_bits(), 0x0200);
        assert_eq!(WriterVariant::Halfword.psize_bits(), 0x0100);
        assert_eq!(WriterVariant::Byte.psize_bits(), 0x0000);
    }
}
