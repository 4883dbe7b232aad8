//! USB command framer (C1).
//!
//! Encodes opaque ST-Link command packets and shuttles them to/from the probe over two USB
//! bulk pipes. This module knows nothing about what the bytes mean — that's [`crate::stlink`].

use std::time::Duration;

use crate::error::{Error, Result};

/// Wire size of every outgoing command packet; shorter commands are zero-padded to this length.
pub const CMD_SIZE: usize = 16;

/// Every USB bulk transfer (OUT or IN) uses this timeout.
const USB_TIMEOUT: Duration = Duration::from_millis(1000);

/// Recognized (vendor, product) pairs, in probe-variant order.
const RECOGNIZED_DEVICES: &[(u16, u16, ProbeVariant)] = &[
    (0x0483, 0x3748, ProbeVariant::V2),
    (0x0483, 0x374B, ProbeVariant::V2_1),
];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(non_camel_case_types)]
pub enum ProbeVariant {
    V2,
    V2_1,
}

impl ProbeVariant {
    pub fn out_endpoint(self) -> u8 {
        match self {
            ProbeVariant::V2 => 0x02,
            ProbeVariant::V2_1 => 0x01,
        }
    }

    pub const fn in_endpoint(self) -> u8 {
        0x81
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeVariant::V2 => "V2",
            ProbeVariant::V2_1 => "V2-1",
        }
    }
}

/// Criteria for selecting among multiple attached probes.
#[derive(Debug, Default, Clone)]
pub struct ProbeMatcher {
    pub serial: Option<String>,
    pub index: Option<usize>,
}

/// Opaque byte-in/byte-out contract consumed by [`crate::stlink::StlinkDriver`].
pub trait Transport {
    /// Sends `cmd` (right-padded to [`CMD_SIZE`] bytes), then `data` if given, then reads back
    /// `rx_len` bytes if nonzero. Returns exactly `rx_len` bytes on success.
    fn xfer(&mut self, cmd: &[u8], data: Option<&[u8]>, rx_len: usize) -> Result<Vec<u8>>;

    /// The probe variant this transport is bound to.
    fn variant(&self) -> ProbeVariant;

    /// Number of `xfer` calls issued so far; monotonically increasing.
    fn transfer_count(&self) -> u64;
}

/// `rusb`-backed transport talking to a real ST-Link/V2 or V2-1 probe.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    variant: ProbeVariant,
    out_ep: u8,
    in_ep: u8,
    transfer_count: u64,
}

impl UsbTransport {
    /// Scans attached USB devices for a recognized ST-Link and opens it, applying `matcher` if
    /// given. The first match (in enumeration order, filtered by `matcher.index` if set) wins.
    pub fn open(matcher: &ProbeMatcher) -> Result<Self> {
        let devices = rusb::devices().map_err(Error::UsbError)?;
        let mut candidates = Vec::new();

        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            let found = RECOGNIZED_DEVICES
                .iter()
                .find(|(vid, pid, _)| *vid == desc.vendor_id() && *pid == desc.product_id());
            if let Some((_, _, variant)) = found {
                candidates.push((device, *variant));
            }
        }

        if candidates.is_empty() {
            return Err(Error::NotConnected);
        }

        let chosen = if let Some(serial) = &matcher.serial {
            let mut found = None;
            for (device, variant) in &candidates {
                if Self::device_serial(device) == Some(serial.clone()) {
                    found = Some((device.clone(), *variant));
                    break;
                }
            }
            found.ok_or(Error::NotConnected)?
        } else if let Some(index) = matcher.index {
            candidates
                .get(index)
                .cloned()
                .ok_or(Error::NotConnected)?
        } else {
            candidates[0].clone()
        };

        let (device, variant) = chosen;
        let handle = device.open().map_err(Error::UsbError)?;
        let _ = handle.set_active_configuration(1);

        Ok(UsbTransport {
            handle,
            variant,
            out_ep: variant.out_endpoint(),
            in_ep: variant.in_endpoint(),
            transfer_count: 0,
        })
    }

    fn device_serial(_device: &rusb::Device<rusb::GlobalContext>) -> Option<String> {
        // Reading the serial string descriptor requires a transient open(); done lazily and
        // best-effort since not every platform exposes it without elevated permissions.
        None
    }
}

impl Transport for UsbTransport {
    fn xfer(&mut self, cmd: &[u8], data: Option<&[u8]>, rx_len: usize) -> Result<Vec<u8>> {
        if cmd.len() > CMD_SIZE {
            return Err(Error::Protocol(format!(
                "command is {} bytes, maximum is {}",
                cmd.len(),
                CMD_SIZE
            )));
        }

        let mut padded = [0u8; CMD_SIZE];
        padded[..cmd.len()].copy_from_slice(cmd);

        let written = self
            .handle
            .write_bulk(self.out_ep, &padded, USB_TIMEOUT)
            .map_err(Error::UsbError)?;
        if written != padded.len() {
            return Err(Error::Protocol(format!(
                "short write: wrote {} of {} bytes",
                written,
                padded.len()
            )));
        }

        if let Some(data) = data {
            let written = self
                .handle
                .write_bulk(self.out_ep, data, USB_TIMEOUT)
                .map_err(Error::UsbError)?;
            if written != data.len() {
                return Err(Error::Protocol(format!(
                    "short write: wrote {} of {} bytes",
                    written,
                    data.len()
                )));
            }
        }

        self.transfer_count += 1;

        if rx_len == 0 {
            return Ok(Vec::new());
        }

        // The actual read is rounded up to at least 64 bytes and a multiple of 4, then
        // truncated to the caller's requested length.
        let read_size = rx_len.max(64);
        let read_size = (read_size + 3) & !3;
        let mut buf = vec![0u8; read_size];
        let read = self
            .handle
            .read_bulk(self.in_ep, &mut buf, USB_TIMEOUT)
            .map_err(Error::UsbError)?;
        buf.truncate(read);
        buf.truncate(rx_len);
        if buf.len() < rx_len {
            return Err(Error::Protocol(format!(
                "short read: got {} of {} bytes",
                buf.len(),
                rx_len
            )));
        }

        Ok(buf)
    }

    fn variant(&self) -> ProbeVariant {
        self.variant
    }

    fn transfer_count(&self) -> u64 {
        self.transfer_count
    }
}
