//! ST-Link V2 driver (C2): debug-port abstraction over the USB framer.

use std::convert::TryFrom;

use num_enum::TryFromPrimitive;

use crate::endian::{push_u32_le, read_u16_be, read_u32_le};
use crate::error::{Error, Result};
use crate::usb::Transport;

/// First-byte command categories and their sub-commands.
mod cmd {
    pub const GET_VERSION: u8 = 0xf1;
    pub const DEBUG_COMMAND: u8 = 0xf2;
    pub const DFU_COMMAND: u8 = 0xf3;
    pub const SWIM_COMMAND: u8 = 0xf4;
    pub const GET_CURRENT_MODE: u8 = 0xf5;
    pub const GET_TARGET_VOLTAGE: u8 = 0xf7;

    pub const DEBUG_EXIT: u8 = 0x21;
    pub const DEBUG_READCOREID: u8 = 0x22;
    pub const DEBUG_APIV2_ENTER: u8 = 0x30;
    #[allow(dead_code)]
    pub const DEBUG_READ_IDCODES: u8 = 0x31;
    pub const DEBUG_READREG: u8 = 0x33;
    pub const DEBUG_WRITEREG: u8 = 0x34;
    pub const DEBUG_WRITEDEBUGREG: u8 = 0x35;
    pub const DEBUG_READDEBUGREG: u8 = 0x36;
    #[allow(dead_code)]
    pub const DEBUG_READALLREGS: u8 = 0x3a;
    #[allow(dead_code)]
    pub const DEBUG_DRIVE_NRST: u8 = 0x3c;
    pub const DEBUG_SWD_SET_FREQ: u8 = 0x43;
    pub const DEBUG_ENTER_SWD: u8 = 0xa3;
    pub const DEBUG_READMEM_32BIT: u8 = 0x07;
    pub const DEBUG_WRITEMEM_32BIT: u8 = 0x08;
    pub const DEBUG_READMEM_8BIT: u8 = 0x0c;
    pub const DEBUG_WRITEMEM_8BIT: u8 = 0x0d;

    pub const DFU_EXIT: u8 = 0x07;

    pub const SWIM_ENTER: u8 = 0x00;
    pub const SWIM_EXIT: u8 = 0x01;

    #[allow(dead_code)]
    pub const NRST_LOW: u8 = 0;
    #[allow(dead_code)]
    pub const NRST_HIGH: u8 = 1;
    #[allow(dead_code)]
    pub const NRST_PULSE: u8 = 2;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ProbeMode {
    Dfu = 0x00,
    Mass = 0x01,
    Debug = 0x02,
    Swim = 0x03,
    Bootloader = 0x04,
}

/// Decoded `GET_VERSION` response.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProbeVersion {
    pub stlink: u8,
    pub jtag: u8,
    pub swim: u8,
}

impl ProbeVersion {
    fn from_raw(raw: u16) -> ProbeVersion {
        ProbeVersion {
            stlink: ((raw >> 12) & 0xf) as u8,
            jtag: ((raw >> 6) & 0x3f) as u8,
            swim: (raw & 0x3f) as u8,
        }
    }

    /// v2 if JTAG version > 11, else v1.
    pub fn api_level(&self) -> u8 {
        if self.jtag > 11 {
            2
        } else {
            1
        }
    }
}

/// The closed set of discrete SWD clock steps the probe supports, highest first.
const SWD_FREQ_MAP: &[(u32, u8)] = &[
    (4_000_000, 0),
    (1_800_000, 1),
    (1_200_000, 2),
    (950_000, 3),
    (480_000, 7),
    (240_000, 15),
    (125_000, 31),
    (100_000, 40),
    (50_000, 79),
    (25_000, 158),
];

/// Maximum payload size of a single 32-bit bulk memory transfer.
pub const MAX_TRANSFER: usize = 1024;

/// Maximum payload size of a single 8-bit bulk memory transfer.
pub const MAX_TRANSFER_8BIT: usize = 64;

pub struct StlinkDriver<T: Transport> {
    transport: T,
}

impl<T: Transport> StlinkDriver<T> {
    pub fn new(transport: T) -> Self {
        StlinkDriver { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn version(&mut self) -> Result<ProbeVersion> {
        let rx = self
            .transport
            .xfer(&[cmd::GET_VERSION, 0x80], None, 6)?;
        Ok(ProbeVersion::from_raw(read_u16_be(&rx[0..2])))
    }

    pub fn mode(&mut self) -> Result<ProbeMode> {
        let rx = self.transport.xfer(&[cmd::GET_CURRENT_MODE], None, 2)?;
        ProbeMode::try_from(rx[0])
            .map_err(|_| Error::Protocol(format!("unknown probe mode byte {:#04x}", rx[0])))
    }

    /// Leaves whatever state the probe is currently in (DFU/DEBUG/SWIM), no-op otherwise.
    pub fn leave_state(&mut self) -> Result<()> {
        match self.mode()? {
            ProbeMode::Dfu => {
                self.transport
                    .xfer(&[cmd::DFU_COMMAND, cmd::DFU_EXIT], None, 0)?;
            }
            ProbeMode::Debug => {
                self.transport
                    .xfer(&[cmd::DEBUG_COMMAND, cmd::DEBUG_EXIT], None, 0)?;
            }
            ProbeMode::Swim => {
                self.transport
                    .xfer(&[cmd::SWIM_COMMAND, cmd::SWIM_EXIT], None, 0)?;
            }
            ProbeMode::Mass | ProbeMode::Bootloader => {}
        }
        Ok(())
    }

    pub fn target_voltage(&mut self) -> Result<f64> {
        self.leave_state()?;
        let rx = self.transport.xfer(&[cmd::GET_TARGET_VOLTAGE], None, 8)?;
        let a0 = read_u32_le(&rx[0..4]);
        let a1 = read_u32_le(&rx[4..8]);
        if a0 == 0 {
            return Ok(0.0);
        }
        Ok(2.0 * a1 as f64 * 1.2 / a0 as f64)
    }

    /// Picks the highest supported discrete step <= `freq` and switches to it.
    pub fn set_swd_freq(&mut self, freq: u32) -> Result<()> {
        for (f, code) in SWD_FREQ_MAP {
            if freq >= *f {
                let rx = self.transport.xfer(
                    &[cmd::DEBUG_COMMAND, cmd::DEBUG_SWD_SET_FREQ, *code],
                    None,
                    2,
                )?;
                if rx[0] != 0x80 {
                    return Err(Error::Protocol(
                        "status byte mismatch switching SWD frequency".into(),
                    ));
                }
                return Ok(());
            }
        }
        Err(Error::BadParam(format!(
            "requested SWD frequency {} Hz is below the lowest supported step (25000 Hz)",
            freq
        )))
    }

    pub fn enter_debug_swd(&mut self) -> Result<()> {
        self.transport.xfer(
            &[cmd::DEBUG_COMMAND, cmd::DEBUG_APIV2_ENTER, cmd::DEBUG_ENTER_SWD],
            None,
            2,
        )?;
        Ok(())
    }

    pub fn read_coreid(&mut self) -> Result<u32> {
        let rx = self
            .transport
            .xfer(&[cmd::DEBUG_COMMAND, cmd::DEBUG_READCOREID], None, 4)?;
        Ok(read_u32_le(&rx[0..4]))
    }

    pub fn set_debugreg32(&mut self, addr: u32, value: u32) -> Result<()> {
        if addr % 4 != 0 {
            return Err(Error::Alignment { addr, width: 32 });
        }
        let mut cmd_buf = vec![cmd::DEBUG_COMMAND, cmd::DEBUG_WRITEDEBUGREG];
        push_u32_le(&mut cmd_buf, addr);
        push_u32_le(&mut cmd_buf, value);
        self.transport.xfer(&cmd_buf, None, 2)?;
        Ok(())
    }

    pub fn get_debugreg32(&mut self, addr: u32) -> Result<u32> {
        if addr % 4 != 0 {
            return Err(Error::Alignment { addr, width: 32 });
        }
        let mut cmd_buf = vec![cmd::DEBUG_COMMAND, cmd::DEBUG_READDEBUGREG];
        push_u32_le(&mut cmd_buf, addr);
        let rx = self.transport.xfer(&cmd_buf, None, 8)?;
        Ok(read_u32_le(&rx[4..8]))
    }

    pub fn get_debugreg16(&mut self, addr: u32) -> Result<u16> {
        if addr % 2 != 0 {
            return Err(Error::Alignment { addr, width: 16 });
        }
        let mut val = self.get_debugreg32(addr & !0x3)?;
        if addr % 4 != 0 {
            val >>= 16;
        }
        Ok((val & 0xffff) as u16)
    }

    pub fn get_debugreg8(&mut self, addr: u32) -> Result<u8> {
        let val = self.get_debugreg32(addr & !0x3)?;
        let shift = (addr % 4) * 8;
        Ok(((val >> shift) & 0xff) as u8)
    }

    pub fn get_reg(&mut self, index: u8) -> Result<u32> {
        let rx = self
            .transport
            .xfer(&[cmd::DEBUG_COMMAND, cmd::DEBUG_READREG, index], None, 8)?;
        Ok(read_u32_le(&rx[4..8]))
    }

    pub fn set_reg(&mut self, index: u8, value: u32) -> Result<()> {
        let mut cmd_buf = vec![cmd::DEBUG_COMMAND, cmd::DEBUG_WRITEREG, index];
        push_u32_le(&mut cmd_buf, value);
        self.transport.xfer(&cmd_buf, None, 2)?;
        Ok(())
    }

    /// Reads `size` bytes at a word-aligned `addr`; `size` must be a non-zero multiple of 4 and
    /// at most [`MAX_TRANSFER`].
    pub fn get_mem32(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        if addr % 4 != 0 {
            return Err(Error::Alignment { addr, width: 32 });
        }
        if size == 0 || size % 4 != 0 || size > MAX_TRANSFER {
            return Err(Error::BadParam(format!(
                "get_mem32 size {} must be a nonzero multiple of 4, at most {}",
                size, MAX_TRANSFER
            )));
        }
        let mut cmd_buf = vec![cmd::DEBUG_COMMAND, cmd::DEBUG_READMEM_32BIT];
        push_u32_le(&mut cmd_buf, addr);
        push_u32_le(&mut cmd_buf, size as u32);
        self.transport.xfer(&cmd_buf, None, size)
    }

    pub fn set_mem32(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if addr % 4 != 0 {
            return Err(Error::Alignment { addr, width: 32 });
        }
        if data.is_empty() || data.len() % 4 != 0 || data.len() > MAX_TRANSFER {
            return Err(Error::BadParam(format!(
                "set_mem32 size {} must be a nonzero multiple of 4, at most {}",
                data.len(),
                MAX_TRANSFER
            )));
        }
        let mut cmd_buf = vec![cmd::DEBUG_COMMAND, cmd::DEBUG_WRITEMEM_32BIT];
        push_u32_le(&mut cmd_buf, addr);
        push_u32_le(&mut cmd_buf, data.len() as u32);
        self.transport.xfer(&cmd_buf, Some(data), 0)?;
        Ok(())
    }

    /// Reads `size` bytes at an arbitrary `addr`; `size` must be at most [`MAX_TRANSFER_8BIT`].
    pub fn get_mem8(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        if size == 0 || size > MAX_TRANSFER_8BIT {
            return Err(Error::BadParam(format!(
                "get_mem8 size {} must be nonzero and at most {}",
                size, MAX_TRANSFER_8BIT
            )));
        }
        let mut cmd_buf = vec![cmd::DEBUG_COMMAND, cmd::DEBUG_READMEM_8BIT];
        push_u32_le(&mut cmd_buf, addr);
        push_u32_le(&mut cmd_buf, size as u32);
        self.transport.xfer(&cmd_buf, None, size)
    }

    pub fn set_mem8(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > MAX_TRANSFER_8BIT {
            return Err(Error::BadParam(format!(
                "set_mem8 size {} must be nonzero and at most {}",
                data.len(),
                MAX_TRANSFER_8BIT
            )));
        }
        let mut cmd_buf = vec![cmd::DEBUG_COMMAND, cmd::DEBUG_WRITEMEM_8BIT];
        push_u32_le(&mut cmd_buf, addr);
        push_u32_le(&mut cmd_buf, data.len() as u32);
        self.transport.xfer(&cmd_buf, Some(data), 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockTransport;
    use crate::usb::ProbeVariant;

    fn driver_with(responses: impl FnOnce(&mut MockTransport)) -> StlinkDriver<MockTransport> {
        let mut t = MockTransport::new(ProbeVariant::V2);
        responses(&mut t);
        StlinkDriver::new(t)
    }

    #[test]
    fn version_decodes_big_endian_bitfields() {
        let mut driver = driver_with(|t| {
            // stlink=2 (0b0010), jtag=28 (0b011100), swim=0 -> 0b0010_011100_000000 = 0x2700
            t.push_response([0x27, 0x00, 0, 0, 0, 0]);
        });
        let v = driver.version().unwrap();
        assert_eq!(v.stlink, 2);
        assert_eq!(v.jtag, 28);
        assert_eq!(v.swim, 0);
        assert_eq!(v.api_level(), 2);
    }

    #[test]
    fn target_voltage_zero_a0_returns_zero() {
        let mut driver = driver_with(|t| {
            t.push_response([0, 0]); // mode query
            t.push_response([0u8; 8]); // a0=0,a1=0
        });
        assert_eq!(driver.target_voltage().unwrap(), 0.0);
    }

    #[test]
    fn target_voltage_formula() {
        let mut driver = driver_with(|t| {
            t.push_response([0, 0]);
            let mut buf = [0u8; 8];
            crate::endian::write_u32_le(&mut buf[0..4], 1000);
            crate::endian::write_u32_le(&mut buf[4..8], 1250);
            t.push_response(buf);
        });
        let v = driver.target_voltage().unwrap();
        assert!((v - (2.0 * 1250.0 * 1.2 / 1000.0)).abs() < 1e-9);
    }

    #[test]
    fn set_swd_freq_below_floor_is_bad_param() {
        let mut driver = driver_with(|_| {});
        let err = driver.set_swd_freq(24_000).unwrap_err();
        assert!(matches!(err, Error::BadParam(_)));
    }

    #[test]
    fn set_swd_freq_picks_highest_step_leq_requested() {
        let mut driver = driver_with(|t| {
            t.push_response([0x80, 0]);
        });
        driver.set_swd_freq(1_000_000).unwrap();
        // cmd bytes: [DEBUG_COMMAND, SWD_SET_FREQ, code] padded to 16
        assert_eq!(driver.transport.sent[0][2], 2); // 1_200_000 step code
    }

    #[test]
    fn get_mem32_rejects_misaligned_address() {
        let mut driver = driver_with(|_| {});
        let err = driver.get_mem32(1, 4).unwrap_err();
        assert!(matches!(err, Error::Alignment { addr: 1, width: 32 }));
    }

    #[test]
    fn get_mem32_rejects_non_multiple_of_4_size() {
        let mut driver = driver_with(|_| {});
        let err = driver.get_mem32(0x2000_0000, 6).unwrap_err();
        assert!(matches!(err, Error::BadParam(_)));
    }

    #[test]
    fn debugreg16_odd_address_is_alignment_error() {
        let mut driver = driver_with(|_| {});
        let err = driver.get_debugreg16(3).unwrap_err();
        assert!(matches!(err, Error::Alignment { addr: 3, width: 16 }));
    }

    #[test]
    fn set_debugreg32_encodes_opcode_address_and_value() {
        let mut driver = driver_with(|t| {
            t.push_response([0, 0]);
        });
        driver.set_debugreg32(0xe000_edf0, 0xa05f_0003).unwrap();

        let sent = &driver.transport.sent[0];
        let expected_prefix = hex_literal::hex!("f2 35 f0 ed 00 e0 03 00 5f a0");
        assert_hex::assert_eq_hex!(&sent[..expected_prefix.len()], &expected_prefix[..]);
    }
}
