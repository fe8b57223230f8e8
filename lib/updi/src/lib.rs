// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side programmer for AVR devices speaking UPDI (the Unified Program
//! and Debug Interface of the tinyAVR/megaAVR 0/1/2-series) over a plain
//! TTL serial adapter.
//!
//! The electrical setup is a single wire: the adapter's TX is tied to RX
//! through a ~4.7 kΩ series resistor, and that node connects to the
//! target's UPDI pin. Everything we transmit echoes back to us, and the
//! target answers on the same line in the guard-time gaps.
//!
//! The crate is layered bottom-up, each layer owning the one below:
//!
//! - [`phy`]: half-duplex framing, echo suppression, BREAK generation.
//! - [`link`]: the UPDI instruction set (LDS/STS, LD/ST, LDCS/STCS,
//!   REPEAT, KEY) and the ACK discipline.
//! - [`session`]: lifecycle, program-mode entry/exit, key negotiation,
//!   block memory access.
//! - [`nvm`]: NVM controller command sequencing and the public
//!   programmer handle, [`Nvm`].
//!
//! A typical session:
//!
//! ```no_run
//! use updi::{devices, Nvm};
//!
//! # fn main() -> Result<(), updi::Error> {
//! let device = devices::lookup("tiny817").unwrap();
//! let mut nvm = Nvm::open_port("/dev/ttyUSB0", 115_200, device)?;
//! nvm.enter_progmode()?;
//! nvm.chip_erase()?;
//! nvm.write_flash(0x8000, &[0xff; 64])?;
//! nvm.leave_progmode()?;
//! # Ok(())
//! # }
//! ```
//!
//! All operations are blocking and a session is single-owner; callers
//! needing concurrency wrap the handle in their own synchronization.

pub mod devices;
pub mod error;
pub mod link;
pub mod nvm;
pub mod phy;
pub mod session;

pub use devices::{DeviceDescriptor, FlashInfo};
pub use error::{
    Error, InputError, NvmError, ProtocolError, Result, StateError,
    TransportError,
};
pub use nvm::{DeviceInfo, Nvm, NvmCommand};
pub use phy::Serial;
pub use session::{Session, Sib};
