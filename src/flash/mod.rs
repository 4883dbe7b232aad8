//! Flash programming orchestration (C4/C5): unlock -> erase -> program -> verify -> lock,
//! staged through a Thumb writer stub injected into target SRAM.
//!
//! The two families below share the staging/polling machinery in this module and differ only
//! in their register bank layout, erase geometry, and completion condition.

pub mod fp;
pub mod fs;

use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::cpu::{Stm32Cpu, SRAM_START};
use crate::error::{Error, Result};
use crate::usb::Transport;

/// Where the writer stub is staged for every family.
pub(crate) const STUB_ADDR: u32 = SRAM_START;
/// Where each block's source data is staged, following the stub.
pub(crate) const DATA_ADDR: u32 = SRAM_START + 0x100;

/// Operations common to every flash family, selected at detection time by the catalog's
/// `flash_driver` tag.
pub trait FlashDriver {
    fn mass_erase(&mut self) -> Result<()>;
    fn erase_range(&mut self, addr: u32, size: usize) -> Result<()>;
    fn program(&mut self, addr: u32, data: &[u8], verify: bool) -> Result<()>;
}

/// A flash op requested against a device whose `flash_driver` tag isn't one this crate knows
/// how to drive. Memory access and core control still work; only flash is unavailable.
pub struct NoFlashDriver;

impl FlashDriver for NoFlashDriver {
    fn mass_erase(&mut self) -> Result<()> {
        Err(Error::NotImplemented("mass_erase"))
    }

    fn erase_range(&mut self, _addr: u32, _size: usize) -> Result<()> {
        Err(Error::NotImplemented("erase_range"))
    }

    fn program(&mut self, _addr: u32, _data: &[u8], _verify: bool) -> Result<()> {
        Err(Error::NotImplemented("program"))
    }
}

/// Stages `stub` at [`STUB_ADDR`] and `block` at [`DATA_ADDR`], loads the writer stub's register
/// convention (R0=src, R1=dst, R2=count, R4=sr_addr, R5=busy_mask, R6=eop_mask), and resumes the
/// core. Callers poll for the breakpoint separately since the page and sector families wait on
/// different completion conditions.
pub(crate) fn stage_and_run_stub<T: Transport>(
    cpu: &mut Stm32Cpu<T>,
    stub: &[u8],
    block: &[u8],
    dest_addr: u32,
    sr_addr: u32,
    busy_mask: u32,
    eop_mask: u32,
) -> Result<()> {
    cpu.set_mem(STUB_ADDR, stub)?;
    cpu.set_mem(DATA_ADDR, block)?;
    cpu.set_reg("R0", DATA_ADDR)?;
    cpu.set_reg("R1", dest_addr)?;
    cpu.set_reg("R2", block.len() as u32)?;
    cpu.set_reg("R4", sr_addr)?;
    cpu.set_reg("R5", busy_mask)?;
    cpu.set_reg("R6", eop_mask)?;
    cpu.set_reg("PC", STUB_ADDR)?;
    cpu.run()
}

/// Polls [`Stm32Cpu::is_halted`] until the stub's `bkpt` fires or `deadline` elapses.
pub(crate) fn wait_for_breakpoint<T: Transport>(
    cpu: &mut Stm32Cpu<T>,
    deadline: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if cpu.is_halted()? {
            return Ok(());
        }
        if start.elapsed() > deadline {
            return Err(Error::Timeout("writer stub breakpoint"));
        }
        sleep(Duration::from_millis(20));
    }
}

/// True if every byte in `block` is `0xFF` — the all-erased-state optimization that skips a
/// stub invocation entirely.
pub(crate) fn is_blank(block: &[u8]) -> bool {
    block.iter().all(|b| *b == 0xff)
}

/// Right-pads `data` with `0xFF` to a multiple of 4 bytes, as both families require before
/// chunking into the writer stub.
pub(crate) fn pad_to_word(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0xff);
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_blank_detects_all_0xff() {
        assert!(is_blank(&[0xff, 0xff, 0xff]));
        assert!(!is_blank(&[0xff, 0x00, 0xff]));
        assert!(is_blank(&[]));
    }

    #[test]
    fn pad_to_word_rounds_up_with_0xff() {
        assert_eq!(pad_to_word(&[1, 2, 3]), vec![1, 2, 3, 0xff]);
        assert_eq!(pad_to_word(&[1, 2, 3, 4]), vec![1, 2, 3, 4]);
    }
}
