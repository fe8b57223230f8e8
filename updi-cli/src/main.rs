// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command line interface for UPDI programming over a TTL serial adapter.
//!
//! Typical invocations:
//!
//! ```text
//! updi -d tiny817 -c /dev/ttyUSB0 -e
//! updi -d tiny817 -c /dev/ttyUSB0 -f app.hex -p -s
//! updi -d tiny817 -c COM2 -u 2:0xD6 -r "1280;11"
//! ```
//!
//! The process exits 0 on success and with a small negative code per
//! failure class, so scripts can tell a wiring problem from a locked part.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};

use updi::{devices, DeviceDescriptor, Nvm};

mod hexfile;

#[derive(Parser)]
#[clap(name = "updi", max_term_width = 80)]
#[clap(about = "Program UPDI-capable AVR devices over a TTL serial port")]
struct Args {
    /// Target device name (e.g. tiny817).
    #[clap(short = 'd', long = "device", value_name = "NAME")]
    device: String,

    /// Serial port (Windows: COMx | *nix: /dev/ttyX).
    #[clap(short = 'c', long = "comport", value_name = "PORT")]
    comport: String,

    /// Baud rate.
    #[clap(short = 'b', long = "baudrate", default_value_t = 115_200)]
    baudrate: u32,

    /// Intel HEX file to program and/or verify.
    #[clap(short = 'f', long = "file", value_name = "FILE")]
    file: Option<PathBuf>,

    /// Perform a chip erase.
    #[clap(short = 'e', long = "erase")]
    erase: bool,

    /// Program the HEX file into flash (erases first, verifies after).
    #[clap(short = 'p', long = "program")]
    program: bool,

    /// Verify flash against the HEX file without writing.
    #[clap(short = 'k', long = "check")]
    check: bool,

    /// Save a readback of the file's flash region to FILE.save.
    #[clap(short = 's', long = "save")]
    save: bool,

    /// Fuse to set, repeatable (syntax: fuse_nr:0xvalue).
    #[clap(short = 'u', long = "fuses", value_name = "IDX:0xVV")]
    fuses: Vec<String>,

    /// Memory reads: "addr;len" pairs joined with '|' (addr hex, len
    /// decimal).
    #[clap(short = 'r', long = "read", value_name = "SPEC")]
    read: Option<String>,

    /// Memory write: "addr;b0;b1;..." (hex bytes).
    #[clap(short = 'w', long = "write", value_name = "SPEC")]
    write: Option<String>,

    /// Verbosity, 0 (quiet) to 6 (wire-level trace).
    #[clap(short = 'v', long = "verbose", default_value_t = 2)]
    verbose: u8,
}

/// Flash verification mismatch; its own type so it gets its own exit code.
#[derive(Debug)]
struct VerifyError {
    address: u32,
    expected: u8,
    got: u8,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "verification failed at {:#06x}: wrote {:#04x}, read {:#04x}",
            self.address, self.expected, self.got
        )
    }
}

impl std::error::Error for VerifyError {}

fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<VerifyError>().is_some() {
        return -7;
    }
    match err.downcast_ref::<updi::Error>() {
        Some(updi::Error::Input(_)) => -2,
        Some(updi::Error::Transport(_)) => -3,
        Some(updi::Error::Protocol(_)) => -4,
        Some(updi::Error::State(_)) => -5,
        Some(updi::Error::Nvm(_)) => -6,
        None => -1,
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .format_timestamp(None)
        .init();

    if let Err(e) = run(&args) {
        error!("{e:#}");
        exit(exit_code(&e));
    }
}

fn run(args: &Args) -> Result<()> {
    let wants_flash_op = args.program || args.check || args.save;
    if wants_flash_op && args.file.is_none() {
        bail!("-p/-k/-s need a HEX file (-f)");
    }
    if !(args.erase
        || wants_flash_op
        || !args.fuses.is_empty()
        || args.read.is_some()
        || args.write.is_some())
    {
        bail!("no action requested (erase, program, check, fuses, read or write)");
    }

    // Parse argument strings up front so a typo fails before we touch the
    // target.
    let fuses = args
        .fuses
        .iter()
        .map(|s| parse_fuse(s))
        .collect::<Result<Vec<_>>>()?;
    let reads = match &args.read {
        Some(spec) => parse_reads(spec)?,
        None => Vec::new(),
    };
    let write = match &args.write {
        Some(spec) => Some(parse_write(spec)?),
        None => None,
    };

    let device = devices::lookup(&args.device).ok_or_else(|| {
        anyhow::Error::from(updi::Error::Input(
            updi::InputError::UnknownDevice,
        ))
        .context(format!(
            "device '{}' not supported (known: {})",
            args.device,
            devices::names().collect::<Vec<_>>().join(", ")
        ))
    })?;

    let mut nvm = Nvm::open_port(&args.comport, args.baudrate, device)
        .with_context(|| format!("can't open session on {}", args.comport))?;

    // Progmode exit and port teardown run on close whatever happens below.
    let result = drive(&mut nvm, args, device, &fuses, &reads, &write);
    nvm.close();
    result
}

fn drive(
    nvm: &mut Nvm,
    args: &Args,
    device: &DeviceDescriptor,
    fuses: &[(u8, u8)],
    reads: &[(u32, usize)],
    write: &Option<(u32, Vec<u8>)>,
) -> Result<()> {
    let dev_info = nvm.get_device_info()?;
    info!(
        "{}: SIB '{}', signature {:02x} {:02x} {:02x}",
        device.name,
        dev_info.sib.family,
        dev_info.signature[0],
        dev_info.signature[1],
        dev_info.signature[2]
    );

    match nvm.enter_progmode() {
        Ok(()) => {}
        Err(updi::Error::Nvm(updi::NvmError::Locked)) => {
            warn!("device is locked; unlocking with chip erase");
            nvm.unlock().context("unlock failed")?;
        }
        Err(e) => return Err(e).context("can't enter programming mode"),
    }

    if args.erase {
        nvm.chip_erase().context("chip erase failed")?;
        info!("chip erased");
    }

    for &(index, value) in fuses {
        nvm.write_fuse(index, value)
            .with_context(|| format!("writing fuse {index} failed"))?;
        info!("fuse {index} = {value:#04x}");
    }

    if let Some(file) = &args.file {
        flash_file(nvm, args, device, file)?;
    }

    for &(address, len) in reads {
        let data = nvm.read_mem(address, len)?;
        print_dump(address, &data);
    }

    if let Some((address, data)) = write {
        nvm.write_mem(*address, data)?;
        info!("wrote {} bytes at {address:#06x}", data.len());
    }

    nvm.leave_progmode()?;
    Ok(())
}

fn flash_file(
    nvm: &mut Nvm,
    args: &Args,
    device: &DeviceDescriptor,
    file: &Path,
) -> Result<()> {
    let image = hexfile::load(file)?;
    let image = hexfile::adjust(image, &device.flash)?;
    info!(
        "image {:#06x}..{:#06x} ({} bytes)",
        image.start,
        image.end(),
        image.data.len()
    );

    if args.program {
        // Erase-before-write is policy here, not a property of the flash
        // primitive. Skip the second erase if -e already ran.
        if !args.erase {
            nvm.chip_erase().context("chip erase failed")?;
        }
        nvm.write_flash(image.start, &image.data)
            .context("flash write failed")?;
        info!("programmed {} bytes", image.data.len());
    }

    if args.program || args.check {
        let readback = nvm.read_flash(image.start, image.data.len())?;
        verify(image.start, &image.data, &readback)?;
        info!("flash verified");
    }

    if args.save {
        let mut name = file.as_os_str().to_owned();
        name.push(".save");
        let path = PathBuf::from(name);
        let readback = nvm.read_flash(image.start, image.data.len())?;
        hexfile::save(
            &path,
            &hexfile::Image {
                start: image.start,
                data: readback,
            },
        )?;
        info!("readback saved to {}", path.display());
    }

    Ok(())
}

fn verify(start: u32, expected: &[u8], got: &[u8]) -> Result<()> {
    for (i, (&e, &g)) in expected.iter().zip(got).enumerate() {
        if e != g {
            return Err(VerifyError {
                address: start + i as u32,
                expected: e,
                got: g,
            }
            .into());
        }
    }
    Ok(())
}

fn print_dump(start: u32, data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        let addr = start + i as u32 * 16;
        let bytes = row
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{addr:04x}: {bytes}");
    }
}

/// "2:0xD6" -> (2, 0xD6). Index decimal, value hex.
fn parse_fuse(spec: &str) -> Result<(u8, u8)> {
    let (index, value) = spec
        .split_once(':')
        .with_context(|| format!("bad fuse spec '{spec}' (want idx:0xVV)"))?;
    let index = index
        .trim()
        .parse::<u8>()
        .with_context(|| format!("bad fuse index in '{spec}'"))?;
    let value = parse_hex_byte(value.trim())
        .with_context(|| format!("bad fuse value in '{spec}'"))?;
    Ok((index, value))
}

/// "8000;16|8100;4" -> [(0x8000, 16), (0x8100, 4)]. Addresses hex, lengths
/// decimal.
fn parse_reads(spec: &str) -> Result<Vec<(u32, usize)>> {
    spec.split('|')
        .map(|pair| {
            let (addr, len) = pair.split_once(';').with_context(|| {
                format!("bad read spec '{pair}' (want addr;len)")
            })?;
            let addr = parse_hex(addr.trim())
                .with_context(|| format!("bad address in '{pair}'"))?;
            let len = len
                .trim()
                .parse::<usize>()
                .with_context(|| format!("bad length in '{pair}'"))?;
            Ok((addr, len))
        })
        .collect()
}

/// "3f00;0x12;0x34" -> (0x3f00, [0x12, 0x34]).
fn parse_write(spec: &str) -> Result<(u32, Vec<u8>)> {
    let mut parts = spec.split(';');
    let addr = parts
        .next()
        .filter(|s| !s.is_empty())
        .context("empty write spec")?;
    let addr =
        parse_hex(addr.trim()).with_context(|| format!("bad address in '{spec}'"))?;
    let data = parts
        .map(|b| {
            parse_hex_byte(b.trim())
                .with_context(|| format!("bad data byte '{b}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    if data.is_empty() {
        bail!("write spec '{spec}' has no data bytes");
    }
    Ok((addr, data))
}

fn parse_hex(s: &str) -> Result<u32> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    Ok(u32::from_str_radix(s, 16)?)
}

fn parse_hex_byte(s: &str) -> Result<u8> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    Ok(u8::from_str_radix(s, 16)?)
}
