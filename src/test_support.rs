//! Test-only fakes shared across unit tests in several modules.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::usb::{ProbeVariant, Transport};

/// Records every `xfer` call and replays a scripted queue of responses.
///
/// Each scripted response is consumed by exactly one `xfer` call with `rx_len > 0`; calls with
/// `rx_len == 0` don't consume a response. Running out of scripted responses is a test bug and
/// panics loudly rather than silently returning empty data.
pub struct MockTransport {
    pub variant: ProbeVariant,
    pub sent: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
    transfer_count: u64,
}

impl MockTransport {
    pub fn new(variant: ProbeVariant) -> Self {
        MockTransport {
            variant,
            sent: Vec::new(),
            responses: VecDeque::new(),
            transfer_count: 0,
        }
    }

    pub fn push_response(&mut self, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.responses.push_back(bytes.into());
        self
    }
}

impl Transport for MockTransport {
    fn xfer(&mut self, cmd: &[u8], data: Option<&[u8]>, rx_len: usize) -> Result<Vec<u8>> {
        let mut padded = vec![0u8; crate::usb::CMD_SIZE];
        padded[..cmd.len()].copy_from_slice(cmd);
        self.sent.push(padded);
        if let Some(data) = data {
            self.sent.push(data.to_vec());
        }
        self.transfer_count += 1;

        if rx_len == 0 {
            return Ok(Vec::new());
        }

        let mut resp = self
            .responses
            .pop_front()
            .unwrap_or_else(|| panic!("MockTransport ran out of scripted responses"));
        if resp.len() < rx_len {
            return Err(Error::Protocol(format!(
                "scripted response too short: {} < {}",
                resp.len(),
                rx_len
            )));
        }
        resp.truncate(rx_len);
        Ok(resp)
    }

    fn variant(&self) -> ProbeVariant {
        self.variant
    }

    fn transfer_count(&self) -> u64 {
        self.transfer_count
    }
}
