//! Cortex-M CPU layer (C3): register file, core control, alignment-aware memory access.

use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::stlink::{StlinkDriver, MAX_TRANSFER};
use crate::usb::Transport;

pub const SRAM_START: u32 = 0x2000_0000;
pub const FLASH_START: u32 = 0x0800_0000;

const AIRCR_REG: u32 = 0xe000_ed0c;
const DHCSR_REG: u32 = 0xe000_edf0;
const DEMCR_REG: u32 = 0xe000_edfc;

const AIRCR_KEY: u32 = 0x05fa_0000;
const AIRCR_SYSRESETREQ_BIT: u32 = 0x0000_0004;

const DHCSR_KEY: u32 = 0xa05f_0000;
const DHCSR_DEBUGEN_BIT: u32 = 0x0000_0001;
const DHCSR_HALT_BIT: u32 = 0x0000_0002;
const DHCSR_STEP_BIT: u32 = 0x0000_0004;
pub const DHCSR_STATUS_HALT_BIT: u32 = 0x0002_0000;

const DEMCR_RUN_AFTER_RESET: u32 = 0x0000_0000;
const DEMCR_HALT_AFTER_RESET: u32 = 0x0000_0001;

/// The named register file, in the same order the probe indexes registers 0..18.
pub const REGISTERS: &[&str] = &[
    "R0", "R1", "R2", "R3", "R4", "R5", "R6", "R7", "R8", "R9", "R10", "R11", "R12", "SP", "LR",
    "PC", "PSR", "MSP", "PSP",
];

fn reg_index(name: &str) -> Result<u8> {
    let upper = name.to_ascii_uppercase();
    REGISTERS
        .iter()
        .position(|r| *r == upper)
        .map(|i| i as u8)
        .ok_or_else(|| Error::BadParam(format!("unknown register name '{}'", name)))
}

pub fn is_reg(name: &str) -> bool {
    REGISTERS.contains(&name.to_ascii_uppercase().as_str())
}

/// Generic STM32/Cortex-M CPU control and memory access, shared by every flash family driver.
pub struct Stm32Cpu<'a, T: Transport> {
    pub(crate) stlink: &'a mut StlinkDriver<T>,
    pub(crate) progress: &'a dyn Progress,
}

impl<'a, T: Transport> Stm32Cpu<'a, T> {
    pub fn new(stlink: &'a mut StlinkDriver<T>, progress: &'a dyn Progress) -> Self {
        Stm32Cpu { stlink, progress }
    }

    pub fn get_reg(&mut self, name: &str) -> Result<u32> {
        let idx = reg_index(name)?;
        self.stlink.get_reg(idx)
    }

    pub fn set_reg(&mut self, name: &str, value: u32) -> Result<()> {
        let idx = reg_index(name)?;
        self.stlink.set_reg(idx, value)
    }

    pub fn get_reg_all(&mut self) -> Result<Vec<(&'static str, u32)>> {
        self.halt()?;
        let mut out = Vec::with_capacity(REGISTERS.len());
        for (i, name) in REGISTERS.iter().enumerate() {
            out.push((*name, self.stlink.get_reg(i as u8)?));
        }
        Ok(out)
    }

    pub fn halt(&mut self) -> Result<()> {
        self.stlink
            .set_debugreg32(DHCSR_REG, DHCSR_KEY | DHCSR_DEBUGEN_BIT | DHCSR_HALT_BIT)
    }

    pub fn step(&mut self) -> Result<()> {
        self.stlink
            .set_debugreg32(DHCSR_REG, DHCSR_KEY | DHCSR_DEBUGEN_BIT | DHCSR_STEP_BIT)
    }

    pub fn run(&mut self) -> Result<()> {
        self.stlink
            .set_debugreg32(DHCSR_REG, DHCSR_KEY | DHCSR_DEBUGEN_BIT)
    }

    pub fn no_debug(&mut self) -> Result<()> {
        self.stlink.set_debugreg32(DHCSR_REG, DHCSR_KEY)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.stlink.set_debugreg32(DEMCR_REG, DEMCR_RUN_AFTER_RESET)?;
        self.stlink
            .set_debugreg32(AIRCR_REG, AIRCR_KEY | AIRCR_SYSRESETREQ_BIT)?;
        // dummy read to flush the reset request before anything else touches the bus
        self.stlink.get_debugreg32(AIRCR_REG)?;
        Ok(())
    }

    /// Leaves the core halted at its reset vector. Idempotent: calling this twice in a row
    /// leaves the core halted at the reset vector both times.
    pub fn reset_halt(&mut self) -> Result<()> {
        self.halt()?;
        self.stlink
            .set_debugreg32(DEMCR_REG, DEMCR_HALT_AFTER_RESET)?;
        self.stlink
            .set_debugreg32(AIRCR_REG, AIRCR_KEY | AIRCR_SYSRESETREQ_BIT)?;
        self.stlink.get_debugreg32(AIRCR_REG)?;
        Ok(())
    }

    pub fn is_halted(&mut self) -> Result<bool> {
        Ok(self.stlink.get_debugreg32(DHCSR_REG)? & DHCSR_STATUS_HALT_BIT != 0)
    }

    /// Reads exactly `size` bytes starting at `addr`, in order, using the chunking schedule
    /// from §4.3: an optional leading 8-bit access to reach word alignment, then as many
    /// word-aligned 32-bit accesses (each at most [`MAX_TRANSFER`] bytes) as fit, then an
    /// optional trailing 8-bit access for the remainder. `size == 0` performs no USB traffic.
    pub fn get_mem(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        self.progress.bargraph_start("Reading memory", 0.0, size as f64);
        let mut data = Vec::with_capacity(size);

        if addr % 4 != 0 {
            let read_size = std::cmp::min(4 - (addr as usize % 4), size);
            data.extend(self.stlink.get_mem8(addr, read_size)?);
        }

        loop {
            self.progress.bargraph_update(data.len() as f64);
            let remaining = size - data.len();
            let aligned = remaining & !0x3;
            if aligned == 0 {
                break;
            }
            let read_size = std::cmp::min(aligned, MAX_TRANSFER);
            let chunk_addr = addr + data.len() as u32;
            data.extend(self.stlink.get_mem32(chunk_addr, read_size)?);
        }

        if data.len() < size {
            let read_size = size - data.len();
            let chunk_addr = addr + data.len() as u32;
            data.extend(self.stlink.get_mem8(chunk_addr, read_size)?);
        }

        self.progress.bargraph_done();
        Ok(data)
    }

    /// Writes `data` starting at `addr` using the same chunking schedule as [`Self::get_mem`].
    pub fn set_mem(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.progress
            .bargraph_start("Writing memory", 0.0, data.len() as f64);
        let mut written = 0usize;

        if addr % 4 != 0 {
            let write_size = std::cmp::min(4 - (addr as usize % 4), data.len());
            self.stlink.set_mem8(addr, &data[..write_size])?;
            written = write_size;
        }

        loop {
            self.progress.bargraph_update(written as f64);
            let remaining = data.len() - written;
            let aligned = remaining & !0x3;
            if aligned == 0 {
                break;
            }
            let write_size = std::cmp::min(aligned, MAX_TRANSFER);
            let chunk_addr = addr + written as u32;
            self.stlink
                .set_mem32(chunk_addr, &data[written..written + write_size])?;
            written += write_size;
        }

        if written < data.len() {
            let chunk_addr = addr + written as u32;
            self.stlink.set_mem8(chunk_addr, &data[written..])?;
        }

        self.progress.bargraph_done();
        Ok(())
    }

    /// Fills `[addr, addr+size)` with repetitions of `pattern`, using the same chunked schedule
    /// as [`Self::set_mem`].
    pub fn fill_mem(&mut self, addr: u32, size: usize, pattern: u8) -> Result<()> {
        let buf = vec![pattern; size];
        self.set_mem(addr, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgress;
    use crate::test_support::MockTransport;
    use crate::usb::ProbeVariant;

    fn cpu_harness<'a>(
        stlink: &'a mut StlinkDriver<MockTransport>,
        progress: &'a NullProgress,
    ) -> Stm32Cpu<'a, MockTransport> {
        Stm32Cpu::new(stlink, progress)
    }

    #[test]
    fn get_mem_zero_size_is_noop() {
        let t = MockTransport::new(ProbeVariant::V2);
        let mut stlink = StlinkDriver::new(t);
        let progress = NullProgress;
        let mut cpu = cpu_harness(&mut stlink, &progress);
        let data = cpu.get_mem(0x0800_0000, 0).unwrap();
        assert!(data.is_empty());
        assert_eq!(cpu.stlink.transport().transfer_count(), 0);
    }

    #[test]
    fn get_mem_18_bytes_is_one_word_access_then_one_byte_access() {
        let mut t = MockTransport::new(ProbeVariant::V2);
        t.push_response(vec![0xAAu8; 16]); // 32-bit access of 16 bytes
        t.push_response(vec![0xBBu8; 2]); // 8-bit access of 2 bytes
        let mut stlink = StlinkDriver::new(t);
        let progress = NullProgress;
        let mut cpu = cpu_harness(&mut stlink, &progress);

        let data = cpu.get_mem(0x0800_0000, 18).unwrap();
        assert_eq!(data.len(), 18);
        assert_eq!(&data[0..16], &[0xAAu8; 16][..]);
        assert_eq!(&data[16..18], &[0xBBu8; 2][..]);
    }

    #[test]
    fn set_mem_1100_bytes_at_unaligned_addr_chunks_as_8_32_32_8() {
        let t = MockTransport::new(ProbeVariant::V2);
        let mut stlink = StlinkDriver::new(t);
        let progress = NullProgress;
        let mut cpu = cpu_harness(&mut stlink, &progress);

        let data = vec![0x11u8; 1100];
        cpu.set_mem(0x2000_0001, &data).unwrap();

        let sent = &cpu.stlink.transport().sent;
        let cmds: Vec<&Vec<u8>> = sent
            .iter()
            .filter(|b| b.len() == crate::usb::CMD_SIZE && b[0] == 0xf2)
            .collect();
        assert_eq!(cmds.len(), 4);
        let opcodes: Vec<u8> = cmds.iter().map(|c| c[1]).collect();
        assert_eq!(opcodes, vec![0x0d, 0x08, 0x08, 0x0d]); // 8bit, 32bit, 32bit, 8bit

        let sizes: Vec<u32> = cmds
            .iter()
            .map(|c| crate::endian::read_u32_le(&c[6..10]))
            .collect();
        assert_eq!(sizes, vec![3, 1024, 72, 1]); // 3 + 1024 + 72 + 1 == 1100
    }

    #[test]
    fn reset_halt_is_idempotent() {
        let mut t = MockTransport::new(ProbeVariant::V2);
        // Each reset_halt() issues three set_debugreg32 (rx=2) and one dummy get_debugreg32
        // (rx=8) to flush the reset request; two calls need eight scripted responses.
        for _ in 0..2 {
            t.push_response([0u8; 2]);
            t.push_response([0u8; 2]);
            t.push_response([0u8; 2]);
            t.push_response([0u8; 8]);
        }
        let mut stlink = StlinkDriver::new(t);
        let progress = NullProgress;
        let mut cpu = cpu_harness(&mut stlink, &progress);
        cpu.reset_halt().unwrap();
        cpu.reset_halt().unwrap();
        // no assertion needed beyond "doesn't error"; the DHCSR halt bit is re-asserted both
        // times by construction since reset_halt always begins with halt().
    }

    #[test]
    fn is_reg_is_case_insensitive() {
        assert!(is_reg("r0"));
        assert!(is_reg("PC"));
        assert!(!is_reg("R99"));
    }
}
