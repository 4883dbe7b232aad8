//! Logging/progress sink consumed by [`crate::cpu`] and the flash drivers.
//!
//! Mirrors the teacher's use of the `log` crate for its bootloader interactions: the core never
//! prints directly, it reports through this trait so the CLI (or a future GUI) controls
//! presentation. A real terminal progress bar belongs to the binary, not the library, so the
//! bargraph here just renders as periodic `debug` lines.

use log::{debug, error, info, warn};

pub trait Progress {
    fn info(&self, msg: &str);
    fn warning(&self, msg: &str);
    fn error(&self, msg: &str);

    fn bargraph_start(&self, label: &str, min: f64, max: f64);
    fn bargraph_update(&self, value: f64);
    fn bargraph_done(&self);
}

/// Renders through the `log` facade; the CLI installs `pretty_env_logger` as the subscriber.
pub struct LogProgress;

impl Progress for LogProgress {
    fn info(&self, msg: &str) {
        info!("{}", msg);
    }

    fn warning(&self, msg: &str) {
        warn!("{}", msg);
    }

    fn error(&self, msg: &str) {
        error!("{}", msg);
    }

    fn bargraph_start(&self, label: &str, min: f64, max: f64) {
        debug!("{}: {:.0}/{:.0}", label, min, max);
    }

    fn bargraph_update(&self, value: f64) {
        debug!("... {:.0}", value);
    }

    fn bargraph_done(&self) {
        debug!("done");
    }
}

/// Discards everything; used by unit tests that don't want log output on the critical path.
pub struct NullProgress;

impl Progress for NullProgress {
    fn info(&self, _msg: &str) {}
    fn warning(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
    fn bargraph_start(&self, _label: &str, _min: f64, _max: f64) {}
    fn bargraph_update(&self, _value: f64) {}
    fn bargraph_done(&self) {}
}
