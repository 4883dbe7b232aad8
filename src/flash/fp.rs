//! Page-erase flash family (C4): STM32F0/F1/F3-class devices, register bank at 0x4002_2000.
//!
//! The "XL" dual-bank variant (large-density STM32F1 parts) duplicates KEYR/SR/CR at a second
//! bank offset; writes above `bank2_boundary` are unlocked/erased/programmed against that
//! second bank instead of the first.

use std::time::Duration;

use crate::cpu::Stm32Cpu;
use crate::error::{Error, Result};
use crate::stlink::MAX_TRANSFER;
use crate::usb::Transport;

use super::{is_blank, pad_to_word, stage_and_run_stub, wait_for_breakpoint, FlashDriver};

const BANK_BASE: u32 = 0x4002_2000;
const KEYR: u32 = BANK_BASE + 0x04;
const SR: u32 = BANK_BASE + 0x0c;
const CR: u32 = BANK_BASE + 0x10;
const AR: u32 = BANK_BASE + 0x14;

/// XL-density parts expose a second bank at this offset from the same peripheral base.
const BANK2_OFFSET: u32 = 0x40;

const CR_PG: u32 = 0x01;
const CR_PER: u32 = 0x02;
const CR_MER: u32 = 0x04;
const CR_STRT: u32 = 0x40;
const CR_LOCK: u32 = 0x80;

const SR_BUSY: u32 = 0x01;
const SR_EOP: u32 = 0x20;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xcdef_89ab;

const MASS_ERASE_FALLBACK: Duration = Duration::from_millis(2000);
const PAGE_ERASE_FALLBACK: Duration = Duration::from_millis(200);
const STUB_DEADLINE: Duration = Duration::from_millis(200);

/// Opaque Thumb halfword-store writer stub: copy R2 halfwords from [R0] to [R1], spinning on
/// SR.BUSY (R5 mask) between each, checking SR.EOP (R6 mask), then `bkpt 0x00`. Adapted from the
/// original page-family writer, with the SR read changed from `[r4, #12]` to `[r4, #0]` since
/// this driver loads R4 with the SR register's own address rather than the flash bank base.
#[rustfmt::skip]
const WRITER_STUB: &[u8] = &[
    0x03, 0x88, // ldrh r3, [r0, #0]
    0x0b, 0x80, // strh r3, [r1, #0]
    // test_busy:
    0x23, 0x68, // ldr  r3, [r4, #0]
    0x2b, 0x42, // tst  r3, r5
    0xfc, 0xd1, // bne  <test_busy>
    0x33, 0x42, // tst  r3, r6
    0x04, 0xd0, // beq  <exit>
    0x02, 0x30, // adds r0, #2
    0x02, 0x31, // adds r1, #2
    0x02, 0x3a, // subs r2, #2
    0x00, 0x2a, // cmp  r2, #0
    0xf3, 0xd1, // bne  <write>
    // exit:
    0x00, 0xbe, // bkpt 0x00
];

pub struct FpDriver<'a, T: Transport> {
    cpu: Stm32Cpu<'a, T>,
    erase_sizes: Vec<u32>,
    dual_bank: bool,
    bank2_boundary: Option<u32>,
}

impl<'a, T: Transport> FpDriver<'a, T> {
    pub fn new(
        cpu: Stm32Cpu<'a, T>,
        erase_sizes: Vec<u32>,
        dual_bank: bool,
        bank2_boundary: Option<u32>,
    ) -> Self {
        FpDriver {
            cpu,
            erase_sizes,
            dual_bank,
            bank2_boundary,
        }
    }

    /// The register bank that governs `addr`: the second bank only when this is a dual-bank
    /// part and `addr` falls at or past the bank boundary.
    fn bank_for(&self, addr: u32) -> (u32, u32, u32) {
        if self.dual_bank {
            if let Some(boundary) = self.bank2_boundary {
                if addr >= boundary {
                    return (KEYR + BANK2_OFFSET, SR + BANK2_OFFSET, CR + BANK2_OFFSET);
                }
            }
        }
        (KEYR, SR, CR)
    }

    fn unlock_bank(&mut self, keyr: u32, cr: u32) -> Result<()> {
        let cr_val = self.cpu.stlink.get_debugreg32(cr)?;
        if cr_val & CR_LOCK != 0 {
            self.cpu.stlink.set_debugreg32(keyr, KEY1)?;
            self.cpu.stlink.set_debugreg32(keyr, KEY2)?;
            let cr_val = self.cpu.stlink.get_debugreg32(cr)?;
            if cr_val & CR_LOCK != 0 {
                return Err(Error::FlashLock);
            }
        }
        Ok(())
    }

    /// Unlocks the bank(s) relevant to `addr`. A mass erase or a program/erase covering the
    /// whole chip unlocks both banks on a dual-bank part.
    fn unlock(&mut self, addr: Option<u32>) -> Result<()> {
        self.cpu.reset_halt()?;
        match (self.dual_bank, addr) {
            (false, _) => self.unlock_bank(KEYR, CR),
            (true, Some(a)) => {
                let (keyr, _, cr) = self.bank_for(a);
                self.unlock_bank(keyr, cr)
            }
            (true, None) => {
                self.unlock_bank(KEYR, CR)?;
                self.unlock_bank(KEYR + BANK2_OFFSET, CR + BANK2_OFFSET)
            }
        }
    }

    fn lock(&mut self) -> Result<()> {
        let cr_val = self.cpu.stlink.get_debugreg32(CR)?;
        self.cpu.stlink.set_debugreg32(CR, cr_val | CR_LOCK)?;
        if self.dual_bank {
            let cr2 = CR + BANK2_OFFSET;
            let cr2_val = self.cpu.stlink.get_debugreg32(cr2)?;
            self.cpu.stlink.set_debugreg32(cr2, cr2_val | CR_LOCK)?;
        }
        self.cpu.reset_halt()
    }

    fn poll_busy(&mut self, sr_addr: u32, deadline: Duration) -> Result<u32> {
        let start = std::time::Instant::now();
        loop {
            let sr = self.cpu.stlink.get_debugreg32(sr_addr)?;
            if sr & SR_BUSY == 0 {
                return Ok(sr);
            }
            if start.elapsed() > deadline {
                return Err(Error::Timeout("page flash SR.BUSY"));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn erase_one_page(&mut self, page_addr: u32) -> Result<()> {
        let (_, sr, cr) = self.bank_for(page_addr);
        self.cpu.stlink.set_debugreg32(cr, CR_PER)?;
        self.cpu.stlink.set_debugreg32(AR, page_addr)?;
        self.cpu.stlink.set_debugreg32(cr, CR_PER | CR_STRT)?;
        let sr_val = self.poll_busy(sr, PAGE_ERASE_FALLBACK)?;
        if sr_val & SR_EOP == 0 {
            return Err(Error::FlashProgram { status: sr_val });
        }
        self.cpu.stlink.set_debugreg32(sr, SR_EOP)?;
        Ok(())
    }

    fn program_block(&mut self, addr: u32, block: &[u8], verify: bool) -> Result<()> {
        if is_blank(block) {
            return Ok(());
        }
        let (_, sr, cr) = self.bank_for(addr);
        self.cpu.stlink.set_debugreg32(cr, CR_PG)?;
        stage_and_run_stub(&mut self.cpu, WRITER_STUB, block, addr, sr, SR_BUSY, SR_EOP)?;
        wait_for_breakpoint(&mut self.cpu, STUB_DEADLINE)?;

        let sr_val = self.cpu.stlink.get_debugreg32(sr)?;
        if sr_val & SR_EOP == 0 {
            return Err(Error::FlashProgram { status: sr_val });
        }
        self.cpu.stlink.set_debugreg32(sr, SR_EOP)?;

        if verify {
            let readback = self.cpu.get_mem(addr, block.len())?;
            if readback != block {
                return Err(Error::VerifyMismatch { addr });
            }
        }
        Ok(())
    }
}

impl<'a, T: Transport> FlashDriver for FpDriver<'a, T> {
    fn mass_erase(&mut self) -> Result<()> {
        self.unlock(None)?;
        self.cpu.stlink.set_debugreg32(CR, CR_MER)?;
        self.cpu.stlink.set_debugreg32(CR, CR_MER | CR_STRT)?;
        let sr_val = self.poll_busy(SR, MASS_ERASE_FALLBACK)?;
        if sr_val & SR_EOP == 0 {
            return Err(Error::FlashProgram { status: sr_val });
        }
        self.cpu.stlink.set_debugreg32(SR, SR_EOP)?;
        if self.dual_bank {
            let cr2 = CR + BANK2_OFFSET;
            let sr2 = SR + BANK2_OFFSET;
            self.cpu.stlink.set_debugreg32(cr2, CR_MER)?;
            self.cpu.stlink.set_debugreg32(cr2, CR_MER | CR_STRT)?;
            let sr2_val = self.poll_busy(sr2, MASS_ERASE_FALLBACK)?;
            if sr2_val & SR_EOP == 0 {
                return Err(Error::FlashProgram { status: sr2_val });
            }
            self.cpu.stlink.set_debugreg32(sr2, SR_EOP)?;
        }
        self.lock()
    }

    fn erase_range(&mut self, addr: u32, size: usize) -> Result<()> {
        self.unlock(Some(addr))?;
        let end = addr + size as u32;
        let page_sizes = self.erase_sizes.clone();
        let mut page_start = crate::cpu::FLASH_START;
        if !page_sizes.is_empty() {
            for page_size in page_sizes.iter().cycle() {
                if page_start >= end {
                    break;
                }
                let page_end = page_start + page_size;
                if page_end > addr && page_start < end {
                    self.erase_one_page(page_start)?;
                }
                page_start = page_end;
            }
        }
        self.lock()
    }

    fn program(&mut self, addr: u32, data: &[u8], verify: bool) -> Result<()> {
        self.unlock(Some(addr))?;
        let (_, sr, cr) = self.bank_for(addr);
        self.cpu.stlink.set_debugreg32(cr, CR_PG)?;

        let padded = pad_to_word(data);
        let mut offset = 0usize;
        while offset < padded.len() {
            let block_len = std::cmp::min(MAX_TRANSFER, padded.len() - offset);
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
    use crate::progress::NullProgress;
    use crate::stlink::StlinkDriver;
    use crate::test_support::MockTransport;
    use crate::usb::ProbeVariant;

    fn driver_with<'a>(
        stlink: &'a mut StlinkDriver<MockTransport>,
        progress: &'a NullProgress,
        dual_bank: bool,
        boundary: Option<u32>,
    ) -> FpDriver<'a, MockTransport> {
        let cpu = Stm32Cpu::new(stlink, progress);
        FpDriver::new(cpu, vec![1024], dual_bank, boundary)
    }

    /// Pushes `count` generic 8-byte zero responses (big enough to satisfy any rx_len this
    /// module ever requests) so reset_halt/unlock/lock bookkeeping calls don't starve the mock.
    fn push_zeros(t: &mut MockTransport, count: usize) {
        for _ in 0..count {
            t.push_response([0u8; 8]);
        }
    }

    #[test]
    fn mass_erase_locks_exactly_once_at_end() {
        let mut t = MockTransport::new(ProbeVariant::V2);
        push_zeros(&mut t, 4); // reset_halt (unlock)
        let mut cr_locked = [0u8; 8];
        crate::endian::write_u32_le(&mut cr_locked[4..8], CR_LOCK);
        t.push_response(cr_locked); // CR read: locked
        push_zeros(&mut t, 2); // KEYR key1, key2
        push_zeros(&mut t, 1); // CR read: now unlocked
        push_zeros(&mut t, 2); // CR <- MER, CR <- MER|STRT
        let mut sr_eop = [0u8; 8];
        crate::endian::write_u32_le(&mut sr_eop[4..8], SR_EOP);
        t.push_response(sr_eop); // SR poll: BUSY clear, EOP set
        push_zeros(&mut t, 1); // SR <- EOP (clear)
        push_zeros(&mut t, 1); // CR read in lock()
        push_zeros(&mut t, 1); // CR <- CR|LOCK
        push_zeros(&mut t, 4); // reset_halt (lock)
        let mut stlink = StlinkDriver::new(t);
        let progress = NullProgress;
        let mut driver = driver_with(&mut stlink, &progress, false, None);

        driver.mass_erase().unwrap();

        let sent = driver.cpu.stlink.transport().sent.clone();
        let cmds: Vec<&Vec<u8>> = sent
            .iter()
            .filter(|b| b.len() == crate::usb::CMD_SIZE && b[0] == 0xf2 && b[1] == 0x35)
            .collect();
        // last WRITEDEBUGREG must target CR with the LOCK bit set
        let last = cmds.last().unwrap();
        let addr = crate::endian::read_u32_le(&last[2..6]);
        let value = crate::endian::read_u32_le(&last[6..10]);
        assert_eq!(addr, CR);
        assert_eq!(value & CR_LOCK, CR_LOCK);
    }

    #[test]
    fn program_skips_all_0xff_blocks_without_staging_a_stub() {
        let mut t = MockTransport::new(ProbeVariant::V2);
        push_zeros(&mut t, 4); // reset_halt (unlock)
        push_zeros(&mut t, 1); // CR read: already unlocked
        push_zeros(&mut t, 1); // CR <- PG
        push_zeros(&mut t, 1); // CR read in lock()
        push_zeros(&mut t, 1); // CR <- CR|LOCK
        push_zeros(&mut t, 4); // reset_halt (lock)
        let mut stlink = StlinkDriver::new(t);
        let progress = NullProgress;
        let mut driver = driver_with(&mut stlink, &progress, false, None);

        driver.program(0x0800_0000, &[0xff; 16], false).unwrap();

        // no WRITEMEM_32BIT/8BIT (opcodes 0x08/0x0d) was ever issued -- the stub never ran.
        let sent = driver.cpu.stlink.transport().sent.clone();
        let staged_data = sent.iter().any(|b| {
            b.len() == crate::usb::CMD_SIZE && b[0] == 0xf2 && (b[1] == 0x08 || b[1] == 0x0d)
        });
        assert!(!staged_data);
    }

    #[test]
    fn bank_for_picks_second_bank_past_boundary() {
        let t = MockTransport::new(ProbeVariant::V2);
        let mut stlink = StlinkDriver::new(t);
        let progress = NullProgress;
        let driver = driver_with(&mut stlink, &progress, true, Some(0x0808_0000));

        let (keyr, sr, cr) = driver.bank_for(0x0800_0000);
        assert_eq!((keyr, sr, cr), (KEYR, SR, CR));

        let (keyr, sr, cr) = driver.bank_for(0x0808_1000);
        assert_eq!(
            (keyr, sr, cr),
            (KEYR + BANK2_OFFSET, SR + BANK2_OFFSET, CR + BANK2_OFFSET)
        );
    }
}
