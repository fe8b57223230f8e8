// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session layer: lifecycle, program-mode entry/exit, key negotiation, and
//! block memory access.
//!
//! A session owns the link (which owns the PHY, which owns the port) and a
//! copy of the device descriptor. Program-mode status lives on the device;
//! the `progmode` flag here is a best-effort cache of it.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::devices::DeviceDescriptor;
use crate::error::{NvmError, Result, StateError};
use crate::link::{self, cs, Key, Link};

/// Bounded retries while polling ASI_SYS_STATUS for program-mode entry and
/// for lock-status clearing, at roughly 1 ms per iteration.
const STATUS_POLL_RETRIES: u32 = 100;
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Decoded System Information Block.
///
/// Byte layout per the SIB table in the UPDI chapter of the tinyAVR
/// 1-series datasheet ("System Information Block"): family in [0..7],
/// a reserved separator at [7], NVM version in [8..11], OCD version in
/// [11..14] (the two version fields are adjacent, with no separator),
/// another reserved byte at [14], and the debug oscillator frequency
/// at [15].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sib {
    pub raw: [u8; 16],
    pub family: String,
    pub nvm_version: String,
    pub ocd_version: String,
    pub dbg_osc_freq: u8,
}

impl Sib {
    fn parse(raw: [u8; 16]) -> Self {
        let text = |r: std::ops::Range<usize>| {
            raw[r]
                .iter()
                .map(|&b| if b.is_ascii_graphic() { b as char } else { ' ' })
                .collect::<String>()
                .trim()
                .to_string()
        };
        Self {
            family: text(0..7),
            nvm_version: text(8..11),
            ocd_version: text(11..14),
            dbg_osc_freq: raw[15],
            raw,
        }
    }
}

/// One exclusive programming session against one target.
pub struct Session {
    link: Link,
    device: DeviceDescriptor,
    sib: Option<Sib>,
    progmode: bool,
    initialized: bool,
}

impl Session {
    pub fn new(link: Link, device: DeviceDescriptor) -> Self {
        Self {
            link,
            device,
            sib: None,
            progmode: false,
            initialized: false,
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Initialization handshake: wake the target with a double BREAK, bring
    /// the link up, and read the SIB so we know who we are talking to.
    pub fn init(&mut self) -> Result<()> {
        self.link.phy().send_double_break()?;
        self.link.initialize()?;
        let sib = Sib::parse(self.link.read_sib()?);
        info!(
            "SIB: family '{}' nvm '{}' ocd '{}'",
            sib.family, sib.nvm_version, sib.ocd_version
        );
        self.sib = Some(sib);
        self.initialized = true;
        Ok(())
    }

    pub fn sib(&self) -> Option<&Sib> {
        self.sib.as_ref()
    }

    /// Moves the session to a new baud rate and re-runs the handshake at
    /// the new speed. Clock-collision detection is already off (from
    /// `init`), so the only requirement is that the rate fits the target's
    /// UPDI clock.
    pub fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.require_init()?;
        self.link.phy().set_baud(baud)?;
        self.init()
    }

    fn require_init(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(StateError::NotInitialized.into())
        }
    }

    pub fn require_progmode(&self) -> Result<()> {
        if self.progmode {
            Ok(())
        } else {
            Err(StateError::NotInProgmode.into())
        }
    }

    pub fn in_progmode_cached(&self) -> bool {
        self.progmode
    }

    /// Asks the device whether NVM programming mode is active.
    pub fn in_progmode(&mut self) -> Result<bool> {
        let status = self.link.ldcs(cs::ASI_SYS_STATUS)?;
        Ok(status & (1 << link::SYS_STATUS_NVMPROG_BIT) != 0)
    }

    /// Asks the device whether it is locked.
    pub fn is_locked(&mut self) -> Result<bool> {
        let status = self.link.ldcs(cs::ASI_SYS_STATUS)?;
        Ok(status & (1 << link::SYS_STATUS_LOCKSTATUS_BIT) != 0)
    }

    /// Enters NVM programming mode with the NVMPROG key.
    ///
    /// Returns `Nvm(Locked)` without touching reset if the device reports
    /// lock status; the caller can recover with [`Session::unlock`].
    pub fn enter_progmode(&mut self) -> Result<()> {
        self.require_init()?;

        if self.in_progmode()? {
            debug!("already in progmode");
            self.progmode = true;
            return Ok(());
        }
        if self.is_locked()? {
            return Err(NvmError::Locked.into());
        }

        self.link.key(Key::NvmProg)?;
        self.check_key_accepted(Key::NvmProg)?;
        self.reset_toggle()?;

        for _ in 0..STATUS_POLL_RETRIES {
            if self.in_progmode()? {
                info!("entered NVM programming mode");
                self.progmode = true;
                return Ok(());
            }
            thread::sleep(STATUS_POLL_INTERVAL);
        }
        Err(StateError::EnterProgmodeFailed.into())
    }

    /// Erase-unlock: the CHIPERASE key wipes the device and clears the lock
    /// bits. Does not enter programming mode by itself.
    pub fn unlock(&mut self) -> Result<()> {
        self.require_init()?;
        info!("unlocking with chip-erase key");

        self.link.key(Key::ChipErase)?;
        self.check_key_accepted(Key::ChipErase)?;
        self.reset_toggle()?;

        for _ in 0..STATUS_POLL_RETRIES {
            if !self.is_locked()? {
                return Ok(());
            }
            thread::sleep(STATUS_POLL_INTERVAL);
        }
        Err(StateError::UnlockFailed.into())
    }

    /// Returns the device to application mode: reset, then disable the UPDI
    /// interface.
    pub fn leave_progmode(&mut self) -> Result<()> {
        self.require_init()?;
        self.reset_toggle()?;
        self.link
            .stcs(cs::CTRLB, 1 << link::CTRLB_UPDIDIS_BIT)?;
        self.progmode = false;
        info!("left NVM programming mode");
        Ok(())
    }

    fn check_key_accepted(&mut self, key: Key) -> Result<()> {
        let status = self.link.ldcs(cs::ASI_KEY_STATUS)?;
        debug!("ASI_KEY_STATUS={status:#04x}");
        if status & (1 << key.status_bit()) == 0 {
            return Err(NvmError::CommandRejected.into());
        }
        Ok(())
    }

    /// Applies and releases a system reset via ASI_RESET_REQ.
    fn reset_toggle(&mut self) -> Result<()> {
        self.link
            .stcs(cs::ASI_RESET_REQ, link::RESET_REQ_SIGNATURE)?;
        self.link.stcs(cs::ASI_RESET_REQ, 0x00)
    }

    /// Reads one byte by direct load.
    pub fn read_byte(&mut self, address: u32) -> Result<u8> {
        Ok(self.link.lds(address, 1)?[0])
    }

    /// Writes one byte by direct store.
    pub fn write_byte(&mut self, address: u32, value: u8) -> Result<()> {
        self.link.sts(address, &[value])
    }

    /// Block read: pointer, REPEAT, LD with post-increment; chunked to the
    /// repeat limit.
    pub fn read_data(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.require_init()?;
        let mut out = Vec::with_capacity(len);
        let mut address = address;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(link::MAX_REPEAT);
            self.link.st_ptr(address)?;
            out.extend_from_slice(&self.link.ld_ptr_inc_block(chunk)?);
            address += chunk as u32;
            remaining -= chunk;
        }
        Ok(out)
    }

    /// Block write, byte access, one ACK per byte.
    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.require_init()?;
        let mut address = address;
        for chunk in data.chunks(link::MAX_REPEAT) {
            self.link.st_ptr(address)?;
            self.link.st_ptr_inc_block(chunk)?;
            address += chunk.len() as u32;
        }
        Ok(())
    }

    /// Block write, word access, one ACK per word. `data.len()` must be
    /// even; the flash page-buffer fill uses this to halve the handshake
    /// overhead.
    pub fn write_data_words(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.require_init()?;
        debug_assert!(data.len() % 2 == 0);
        let mut address = address;
        for chunk in data.chunks(link::MAX_REPEAT) {
            self.link.st_ptr(address)?;
            self.link.st_ptr_inc_block_words(chunk)?;
            address += chunk.len() as u32;
        }
        Ok(())
    }
}
