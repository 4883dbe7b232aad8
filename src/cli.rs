use std::path::PathBuf;

use structopt::StructOpt;

/// Parses a `u32` accepting either decimal or a `0x`-prefixed hex literal, since addresses are
/// far more legible in hex on the command line.
fn parse_u32(src: &str) -> Result<u32, std::num::ParseIntError> {
    match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => src.parse(),
    }
}

#[derive(StructOpt, Debug)]
pub enum FlashCommand {
    /// Erase (optionally), program, and optionally verify flash from a file
    Write {
        filename: PathBuf,
        /// Erase the target range before programming
        #[structopt(long)]
        erase: bool,
        /// Read back every programmed block and compare it against what was written
        #[structopt(long)]
        verify: bool,
        /// Base address; ignored for SREC input if the record supplies its own address
        #[structopt(long, parse(try_from_str = parse_u32), default_value = "0x08000000")]
        addr: u32,
    },
    /// Mass-erase flash without programming anything
    Erase,
}

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Dump a region of memory as 32-bit words
    Dump {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        size: u32,
    },
    /// Dump a region of memory as 16-bit halfwords
    Dump16 {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        size: u32,
    },
    /// Dump a region of memory as bytes
    Dump8 {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        size: u32,
    },
    /// Read a region of memory into a file
    Read {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        size: u32,
        filename: PathBuf,
    },
    /// Write a single 32-bit word to memory
    Set {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        value: u32,
    },
    /// Write a file's contents to memory (RAM, not flash -- see `flash` for that)
    Write {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
        filename: PathBuf,
    },
    /// Fill a region of memory with a repeated byte pattern
    Fill {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        size: u32,
        pattern: u8,
    },
    /// Flash programming operations
    Flash(FlashCommand),
    /// Reset the core
    Reset {
        /// Leave the core halted at its reset vector instead of letting it run
        #[structopt(long)]
        halt: bool,
    },
    /// Halt the core
    Halt,
    /// Single-step the core
    Step,
    /// Resume the core
    Run,
    /// Sleep for a number of seconds; useful between scripted steps
    Sleep { seconds: u64 },
}

#[derive(StructOpt, Debug)]
#[structopt(name = "stlink-flash")]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// Only report errors
    #[structopt(short = "q", long, conflicts_with_all = &["info", "verbose", "debug"])]
    pub quiet: bool,
    /// Informational output (the default)
    #[structopt(short = "i", long)]
    pub info: bool,
    /// Verbose output
    #[structopt(short = "v", long)]
    pub verbose: bool,
    /// Debug output, including every USB transfer
    #[structopt(short = "d", long)]
    pub debug: bool,

    /// Expected CPU type (e.g. STM32F103RCT6); narrows catalog matches and fails detection if
    /// the connected part doesn't match
    #[structopt(long)]
    pub cpu: Option<String>,
    /// Leave the target halted instead of resuming it once the command completes
    #[structopt(long = "no-run")]
    pub no_run: bool,
    /// Select the probe by USB serial string
    #[structopt(long)]
    pub serial: Option<String>,
    /// Select the probe by positional index among attached probes
    #[structopt(long)]
    pub index: Option<usize>,
}

impl Opts {
    pub fn log_level(&self) -> log::LevelFilter {
        if self.debug {
            log::LevelFilter::Debug
        } else if self.verbose {
            log::LevelFilter::Trace
        } else if self.quiet {
            log::LevelFilter::Error
        } else {
            log::LevelFilter::Info
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_u32_accepts_hex_and_decimal() {
        assert_eq!(parse_u32("0x08000000").unwrap(), 0x0800_0000);
        assert_eq!(parse_u32("1024").unwrap(), 1024);
    }

    #[test]
    fn log_level_defaults_to_info() {
        let opts = Opts {
            command: Command::Halt,
            quiet: false,
            info: false,
            verbose: false,
            debug: false,
            cpu: None,
            no_run: false,
            serial: None,
            index: None,
        };
        assert_eq!(opts.log_level(), log::LevelFilter::Info);
    }
}
