// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Half-duplex framed transport over a serial byte stream.
//!
//! UPDI runs over a single wire: the host's TX and RX are tied together
//! through a series resistor and connected to the target's UPDI pin. Two
//! consequences shape this module:
//!
//! 1. Every byte we transmit comes right back at us on RX. `send` reads the
//!    echo back and checks it against what went out, which doubles as a
//!    cheap detection of wiring faults and bus contention.
//! 2. A BREAK (line held low for longer than one frame) resets the UPDI
//!    peripheral on the target. We generate one portably by dropping the
//!    baud rate below 2400 and transmitting a 0x00 frame, which holds the
//!    line low for the whole character time at the slow rate.
//!
//! Frames are 8 data bits, even parity, 2 stop bits, idle high. There are
//! no retries at this layer; a timeout or echo mismatch surfaces as-is.

use std::io;
use std::time::Duration;

use log::trace;

use crate::error::{Result, TransportError};

/// The BREAK character. At `BREAK_BAUD` this holds the line low for well
/// over one UPDI frame time at any operating baud rate.
const BREAK_CHAR: u8 = 0x00;

/// Baud rate used while generating BREAK conditions. Anything at or below
/// 2400 is slow enough; 300 gives a wide margin for targets still running
/// at the 4 MHz/8x startup baud.
const BREAK_BAUD: u32 = 300;

/// Read deadline as a multiple of the frame time. Anything past ~10 frames
/// of silence means the target is not answering; the extra slack absorbs
/// USB adapter latency.
const TIMEOUT_FRAMES: u64 = 20;

/// Bits per frame: start + 8 data + parity + 2 stop.
const FRAME_BITS: u64 = 12;

/// Byte-stream transport contract consumed by [`Phy`].
///
/// The production implementation is [`TtyPort`], a thin wrapper over the
/// `serialport` crate. Tests substitute loopbacks and behavioral target
/// models.
pub trait Serial {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
    fn set_baud(&mut self, baud: u32) -> io::Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// A real serial port, configured for UPDI framing (8E2).
pub struct TtyPort {
    port: Box<dyn serialport::SerialPort>,
}

impl TtyPort {
    /// Opens `path` at `baud` with even parity and two stop bits.
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let settings = serialport::SerialPortSettings {
            baud_rate: baud,
            data_bits: serialport::DataBits::Eight,
            flow_control: serialport::FlowControl::None,
            parity: serialport::Parity::Even,
            stop_bits: serialport::StopBits::Two,
            timeout: read_timeout(baud),
        };
        let port = serialport::open_with_settings(path, &settings)
            .map_err(|_| TransportError::PortClosed)?;
        Ok(Self { port })
    }
}

impl Serial for TtyPort {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.port, data)?;
        self.port.flush()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        io::Read::read_exact(&mut self.port, buf)
    }

    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.port
            .set_baud_rate(baud)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.description))
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.description))
    }
}

/// Read deadline scaled to the frame time at `baud`, with a floor that
/// absorbs scheduler and USB latency.
fn read_timeout(baud: u32) -> Duration {
    let us = FRAME_BITS * 1_000_000 * TIMEOUT_FRAMES / u64::from(baud.max(1));
    Duration::from_micros(us).max(Duration::from_millis(25))
}

fn map_io(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::UnexpectedEof => TransportError::Timeout,
        _ => TransportError::PortClosed,
    }
}

/// Half-duplex framing over a [`Serial`] transport.
pub struct Phy {
    port: Box<dyn Serial>,
    baud: u32,
}

impl Phy {
    /// Wraps an already-open transport running at `baud` and establishes a
    /// clean idle state (read deadline set from the frame time).
    pub fn new(mut port: Box<dyn Serial>, baud: u32) -> Result<Self> {
        port.set_timeout(read_timeout(baud)).map_err(map_io)?;
        Ok(Self { port, baud })
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Changes the operating baud rate. The caller is responsible for having
    /// told the target first (clock-collision detection must be off).
    pub fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud(baud).map_err(map_io)?;
        self.port.set_timeout(read_timeout(baud)).map_err(map_io)?;
        self.baud = baud;
        Ok(())
    }

    /// Transmits `bytes`, then reads back and verifies the echo produced by
    /// the shared line.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("phy send {:02x?}", bytes);
        self.port.write_all(bytes).map_err(map_io)?;

        let mut echo = vec![0u8; bytes.len()];
        self.port.read_exact(&mut echo).map_err(map_io)?;
        if echo != bytes {
            trace!("phy echo mismatch, got {:02x?}", echo);
            return Err(TransportError::EchoMismatch.into());
        }
        Ok(())
    }

    /// Reads exactly `n` response bytes (the echo of our own transmission
    /// has already been consumed by `send`).
    pub fn recv(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.port.read_exact(&mut buf).map_err(map_io)?;
        trace!("phy recv {:02x?}", buf);
        Ok(buf)
    }

    /// Drives the line low for at least one frame time to reset the UPDI
    /// peripheral, then restores the configured baud rate.
    pub fn send_break(&mut self) -> Result<()> {
        trace!("phy break");
        self.at_break_baud(|phy| phy.send(&[BREAK_CHAR]))
    }

    /// The documented UPDI wake pattern: two BREAK characters with an idle
    /// gap (the slow-rate stop bits) between them, forcing the target's
    /// receiver into a known state whatever it was doing.
    pub fn send_double_break(&mut self) -> Result<()> {
        trace!("phy double break");
        self.at_break_baud(|phy| phy.send(&[BREAK_CHAR, BREAK_CHAR]))
    }

    fn at_break_baud(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let baud = self.baud;
        self.set_baud(BREAK_BAUD)?;
        let result = f(self);
        // Restore the session rate even if the break itself failed.
        self.set_baud(baud)?;
        result
    }
}
