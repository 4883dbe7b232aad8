use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;

use stlink_flash::cli::{Command, FlashCommand, Opts};
use stlink_flash::io;
use stlink_flash::session::Session;
use stlink_flash::usb::{ProbeMatcher, UsbTransport};

fn main() -> Result<()> {
    let opts = Opts::from_args();

    pretty_env_logger::formatted_builder()
        .filter_level(opts.log_level())
        .init();

    let matcher = ProbeMatcher {
        serial: opts.serial.clone(),
        index: opts.index,
    };

    let mut session =
        Session::open(&matcher, opts.cpu.as_deref()).context("connecting to target")?;
    session.set_stay_in_debug(opts.no_run);

    run_command(&mut session, &opts.command)?;

    if !opts.no_run {
        session.cpu().run().context("resuming core")?;
    }

    Ok(())
}

fn run_command(session: &mut Session<UsbTransport>, command: &Command) -> Result<()> {
    match command {
        Command::Dump { address, size } => {
            let data = session
                .cpu()
                .get_mem(*address, *size as usize)
                .context("reading memory")?;
            print!("{}", io::hex_dump(*address, &data, 4));
        }
        Command::Dump16 { address, size } => {
            let data = session
                .cpu()
                .get_mem(*address, *size as usize)
                .context("reading memory")?;
            print!("{}", io::hex_dump(*address, &data, 2));
        }
        Command::Dump8 { address, size } => {
            let data = session
                .cpu()
                .get_mem(*address, *size as usize)
                .context("reading memory")?;
            print!("{}", io::hex_dump(*address, &data, 1));
        }
        Command::Read { address, size, filename } => {
            let data = session
                .cpu()
                .get_mem(*address, *size as usize)
                .context("reading memory")?;
            io::write_raw_file(filename, &data).context("writing output file")?;
        }
        Command::Set { address, value } => {
            session
                .cpu()
                .set_mem(*address, &value.to_le_bytes())
                .context("writing memory")?;
        }
        Command::Write { address, filename } => {
            let data = io::read_raw_file(filename).context("reading input file")?;
            session.cpu().set_mem(*address, &data).context("writing memory")?;
        }
        Command::Fill { address, size, pattern } => {
            session
                .cpu()
                .fill_mem(*address, *size as usize, *pattern)
                .context("filling memory")?;
        }
        Command::Flash(flash_cmd) => run_flash_command(session, flash_cmd)?,
        Command::Reset { halt } => {
            if *halt {
                session.cpu().reset_halt().context("resetting target")?;
            } else {
                session.cpu().reset().context("resetting target")?;
            }
        }
        Command::Halt => {
            session.cpu().halt().context("halting core")?;
        }
        Command::Step => {
            session.cpu().step().context("stepping core")?;
        }
        Command::Run => {
            session.cpu().run().context("resuming core")?;
        }
        Command::Sleep { seconds } => {
            std::thread::sleep(Duration::from_secs(*seconds));
        }
    }
    Ok(())
}

fn run_flash_command(session: &mut Session<UsbTransport>, command: &FlashCommand) -> Result<()> {
    match command {
        FlashCommand::Erase => {
            session
                .flash_driver()?
                .mass_erase()
                .context("mass-erasing flash")?;
        }
        FlashCommand::Write { filename, erase, verify, addr } => {
            let (base, data) = load_flash_image(filename, *addr)?;
            let mut driver = session.flash_driver()?;
            if *erase {
                driver
                    .erase_range(base, data.len())
                    .context("erasing flash range")?;
            }
            driver.program(base, &data, *verify).context("programming flash")?;
        }
    }
    Ok(())
}

/// Loads `filename` as an S-record image when its contents look like one, falling back to a
/// raw binary staged at `addr` otherwise. Multiple S-record blocks are flattened into one
/// contiguous image, gaps between them padded with `0xFF`.
fn load_flash_image(filename: &PathBuf, addr: u32) -> Result<(u32, Vec<u8>)> {
    if let Ok(text) = std::fs::read_to_string(filename) {
        if text.trim_start().starts_with('S') {
            let blocks = io::parse_srec(&text).context("parsing S-record file")?;
            if let Some(first) = blocks.first() {
                let base = first.address;
                let mut data = Vec::new();
                for block in &blocks {
                    data.resize((block.address - base) as usize, 0xff);
                    data.extend_from_slice(&block.data);
                }
                return Ok((base, data));
            }
        }
    }
    let data = io::read_raw_file(filename).context("reading flash image")?;
    Ok((addr, data))
}
