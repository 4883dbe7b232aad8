use thiserror::Error;

/// The taxonomy of failures the core can raise.
///
/// Every fallible operation in this crate returns one of these kinds; the core never catches
/// its own errors, it only runs the shutdown sequence before propagating them (see
/// [`crate::session::Session`]).
#[derive(Error, Debug)]
pub enum Error {
    #[error("no ST-Link probe found, or target not responding (coreid=0)")]
    NotConnected,

    #[error("USB transport error: {0}")]
    UsbError(#[from] rusb::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("alignment error: address {addr:#010x} is not valid for a {width}-bit access")]
    Alignment { addr: u32, width: u8 },

    #[error("unsupported target: {0}")]
    Unsupported(String),

    #[error("bad parameter: {0}")]
    BadParam(String),

    #[error("FLASH_CR.LOCK remained set after writing the unlock keys")]
    FlashLock,

    #[error(
        "target supply voltage {voltage:.2}V is below the minimum required for flash program/erase"
    )]
    FlashVoltage { voltage: f64 },

    #[error("flash programming failed, status register read back {status:#010x}")]
    FlashProgram { status: u32 },

    #[error("verify failed: read-back of block at {addr:#010x} does not match what was written")]
    VerifyMismatch { addr: u32 },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("{0} is not implemented for this target's flash driver")]
    NotImplemented(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
