//! Session lifecycle: owns the probe connection and the detected target for one CLI invocation,
//! and guarantees the shutdown sequence (disable debug, leave whatever probe mode was entered)
//! runs exactly once, whether triggered by an explicit [`Session::disconnect`] or by drop.

use crate::catalog::Catalog;
use crate::cpu::{Stm32Cpu, FLASH_START, SRAM_START};
use crate::detect::{detect, DetectedTarget};
use crate::error::Result;
use crate::flash::fp::FpDriver;
use crate::flash::fs::FsDriver;
use crate::flash::{FlashDriver, NoFlashDriver};
use crate::progress::{LogProgress, Progress};
use crate::stlink::StlinkDriver;
use crate::usb::{ProbeMatcher, Transport, UsbTransport};

/// The SWD clock this tool requests once it has entered debug mode; conservative enough to
/// work across every part in the catalog.
const DEFAULT_SWD_FREQ: u32 = 4_000_000;

/// An open probe connection with a detected target. Dropping it (or calling
/// [`Session::disconnect`] explicitly) disables debug on the core and returns the probe to its
/// idle USB mode.
pub struct Session<T: Transport> {
    stlink: StlinkDriver<T>,
    progress: Box<dyn Progress>,
    target: DetectedTarget,
    disconnected: bool,
    /// When set, shutdown skips `core_nodebug` and leaves the core under debug control — the
    /// `--no-run` CLI flag's "stay in debug" half (§7: "unless the caller set 'stay in debug'").
    stay_in_debug: bool,
}

impl Session<UsbTransport> {
    /// Opens the matching USB probe, enters SWD, and runs detection against the built-in
    /// catalog, optionally narrowed by an expected CPU type string.
    pub fn open(matcher: &ProbeMatcher, expected_type: Option<&str>) -> Result<Self> {
        let transport = UsbTransport::open(matcher)?;
        Session::from_transport(transport, expected_type)
    }
}

impl<T: Transport> Session<T> {
    /// Builds a session directly from an already-constructed transport; the entry point tests
    /// use to drive the full connect/detect sequence against a [`crate::test_support::MockTransport`].
    pub fn from_transport(transport: T, expected_type: Option<&str>) -> Result<Self> {
        let mut stlink = StlinkDriver::new(transport);
        let progress: Box<dyn Progress> = Box::new(LogProgress);

        // Probe version and supply voltage are read before entering SWD debug mode, mirroring
        // the original tool's connect sequence -- target_voltage() itself calls leave_state(),
        // which would drop straight back out of debug mode if it ran any later.
        let version = stlink.version()?;
        progress.info(&format!(
            "STLINK: v{} JTAG: v{} SWIM: v{} (API v{})",
            version.stlink,
            version.jtag,
            version.swim,
            version.api_level()
        ));
        let voltage = stlink.target_voltage()?;
        progress.info(&format!("SUPPLY: {:.2}V", voltage));

        stlink.enter_debug_swd()?;
        stlink.set_swd_freq(DEFAULT_SWD_FREQ)?;

        let catalog = Catalog::builtin();
        let target = {
            let mut cpu = Stm32Cpu::new(&mut stlink, progress.as_ref());
            detect(&mut cpu, &catalog, expected_type)?
        };

        Ok(Session {
            stlink,
            progress,
            target,
            disconnected: false,
            stay_in_debug: false,
        })
    }

    /// Sets whether shutdown should leave the core under debug control instead of issuing
    /// `core_nodebug`. The CLI sets this from `--no-run`: a caller who asked to leave the target
    /// halted almost certainly doesn't want the act of disconnecting to let it run again.
    pub fn set_stay_in_debug(&mut self, stay: bool) {
        self.stay_in_debug = stay;
    }

    pub fn target(&self) -> &DetectedTarget {
        &self.target
    }

    pub fn cpu(&mut self) -> Stm32Cpu<'_, T> {
        Stm32Cpu::new(&mut self.stlink, self.progress.as_ref())
    }

    /// Builds the flash driver for the detected device's `flash_driver` tag. A sector-family
    /// part that can't be read at a supported voltage band fails here rather than falling back
    /// silently, since every other operation on it would then also be unreliable.
    pub fn flash_driver(&mut self) -> Result<Box<dyn FlashDriver + '_>> {
        let erase_sizes = self.target.device.erase_sizes.clone();
        match self.target.device.flash_driver.as_str() {
            "FP" => Ok(Box::new(FpDriver::new(self.cpu(), erase_sizes, false, None))),
            "FPXL" => {
                // XL-density parts split their flash evenly across the two banks; see DESIGN.md.
                let boundary = FLASH_START + (self.target.flash_size_kb as u32 * 1024) / 2;
                Ok(Box::new(FpDriver::new(self.cpu(), erase_sizes, true, Some(boundary))))
            }
            "FS" => Ok(Box::new(FsDriver::new(self.cpu(), erase_sizes)?)),
            _ => Ok(Box::new(NoFlashDriver)),
        }
    }

    pub fn read_sram(&mut self, offset: u32, size: usize) -> Result<Vec<u8>> {
        self.cpu().get_mem(SRAM_START + offset, size)
    }

    pub fn read_flash(&mut self, offset: u32, size: usize) -> Result<Vec<u8>> {
        self.cpu().get_mem(FLASH_START + offset, size)
    }

    /// Disables debug (unless [`Self::set_stay_in_debug`] was set) and leaves whatever probe
    /// mode this session entered. Idempotent: only the first call does anything, so an explicit
    /// call followed by drop is safe.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        if !self.stay_in_debug {
            let _ = self.cpu().no_debug();
        }
        let _ = self.stlink.leave_state();
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgress;
    use crate::test_support::MockTransport;
    use crate::usb::ProbeVariant;

    #[test]
    fn disconnect_is_idempotent() {
        let mut t = MockTransport::new(ProbeVariant::V2);
        t.push_response([0x80, 0]); // no_debug(): set_debugreg32 ack
        t.push_response([0x01, 0]); // leave_state(): mode() -> Mass, nothing further to exit

        let core = Catalog::builtin().cores[0].clone();
        let device = core.devices[0].clone();
        let variant = device.variants[0].clone();
        let target = DetectedTarget {
            core,
            device,
            flash_size_kb: variant.flash_size_kb,
            sram_kb: variant.sram_kb,
            eeprom_kb: variant.eeprom_kb,
            variants: vec![variant],
        };

        let mut session = Session {
            stlink: StlinkDriver::new(t),
            progress: Box::new(NullProgress),
            target,
            disconnected: false,
            stay_in_debug: false,
        };

        session.disconnect();
        let count_after_first = session.stlink.transport().transfer_count();
        session.disconnect();
        assert_eq!(session.stlink.transport().transfer_count(), count_after_first);
    }

    #[test]
    fn stay_in_debug_skips_no_debug_but_still_leaves_probe_state() {
        let mut t = MockTransport::new(ProbeVariant::V2);
        t.push_response([0x01, 0]); // leave_state(): mode() -> Mass, nothing further to exit

        let core = Catalog::builtin().cores[0].clone();
        let device = core.devices[0].clone();
        let variant = device.variants[0].clone();
        let target = DetectedTarget {
            core,
            device,
            flash_size_kb: variant.flash_size_kb,
            sram_kb: variant.sram_kb,
            eeprom_kb: variant.eeprom_kb,
            variants: vec![variant],
        };

        let mut session = Session {
            stlink: StlinkDriver::new(t),
            progress: Box::new(NullProgress),
            target,
            disconnected: false,
            stay_in_debug: true,
        };

        // Only one scripted response (leave_state's mode query) was pushed; if disconnect()
        // still called no_debug() this would panic on an empty response queue.
        session.disconnect();
    }
}
