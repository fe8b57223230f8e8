// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UPDI instruction layer.
//!
//! Every instruction starts with the SYNCH character 0x55, followed by an
//! opcode whose upper bits select the instruction class and whose lower
//! bits encode pointer access mode and address/data sizes. Stores are
//! acknowledged by the target with 0x40 after every write phase; loads
//! answer with data bytes directly.
//!
//! The REPEAT prefix makes the next (and only the next) LD/ST execute N+1
//! times. To keep that invariant out of callers' hands, `repeat` is private
//! and only reachable through the batched block helpers.

use log::debug;

use crate::error::{ProtocolError, Result};
use crate::phy::Phy;

/// SYNCH character opening every instruction frame.
pub const SYNC: u8 = 0x55;
/// Acknowledge byte returned by the target after each write phase.
pub const ACK: u8 = 0x40;

// Instruction class opcodes (upper bits).
const OP_LDS: u8 = 0x00;
const OP_STS: u8 = 0x40;
const OP_LD: u8 = 0x20;
const OP_ST: u8 = 0x60;
const OP_LDCS: u8 = 0x80;
const OP_STCS: u8 = 0xC0;
const OP_REPEAT: u8 = 0xA0;
const OP_KEY: u8 = 0xE0;

// LDS/STS address size field, bits [3:2].
const ADDR_16: u8 = 0x04;
const ADDR_24: u8 = 0x08;

// Data size field, bits [1:0]. For LD/ST pointer-write this field carries
// the pointer (address) size instead.
const DATA_8: u8 = 0x00;
const DATA_16: u8 = 0x01;
const DATA_24: u8 = 0x02;

// LD/ST pointer access mode, bits [3:2].
const PTR_INC: u8 = 0x04;
const PTR_ADDR: u8 = 0x08;

// KEY opcode variants.
const KEY_SEND: u8 = 0x00;
const KEY_SIB: u8 = 0x04;
const KEY_LEN_64: u8 = 0x00;
const KEY_LEN_128: u8 = 0x01;

// REPEAT count size, bits [1:0].
const REPEAT_BYTE: u8 = 0x00;

/// Control/status register space, reachable only via LDCS/STCS.
pub mod cs {
    pub const STATUSA: u8 = 0x00;
    pub const STATUSB: u8 = 0x01;
    pub const CTRLA: u8 = 0x02;
    pub const CTRLB: u8 = 0x03;
    pub const ASI_KEY_STATUS: u8 = 0x07;
    pub const ASI_RESET_REQ: u8 = 0x08;
    pub const ASI_CTRLA: u8 = 0x09;
    pub const ASI_SYS_CTRLA: u8 = 0x0A;
    pub const ASI_SYS_STATUS: u8 = 0x0B;
    pub const ASI_CRC_STATUS: u8 = 0x0C;
}

/// UPDI.CTRLA: inter-byte delay enable.
pub const CTRLA_IBDLY_BIT: u8 = 7;

/// UPDI.CTRLB bits and the guard-time field in its low bits. The guard
/// time is the idle gap the target inserts before driving the shared line;
/// it is session state and is wiped by BREAK.
pub const CTRLB_UPDIDIS_BIT: u8 = 2;
pub const CTRLB_CCDETDIS_BIT: u8 = 3;
pub const CTRLB_GTVAL_MASK: u8 = 0x03;

/// Guard time programmed at initialization: two idle cycles.
pub const GUARD_TIME_INIT: u8 = 2;

/// ASI_KEY_STATUS bits.
pub const KEY_STATUS_CHIPERASE_BIT: u8 = 3;
pub const KEY_STATUS_NVMPROG_BIT: u8 = 4;
pub const KEY_STATUS_UROWWRITE_BIT: u8 = 5;

/// ASI_SYS_STATUS bits.
pub const SYS_STATUS_RSTSYS_BIT: u8 = 5;
pub const SYS_STATUS_INSLEEP_BIT: u8 = 4;
pub const SYS_STATUS_NVMPROG_BIT: u8 = 3;
pub const SYS_STATUS_UROWPROG_BIT: u8 = 2;
pub const SYS_STATUS_LOCKSTATUS_BIT: u8 = 0;

/// ASI_RESET_REQ signature that asserts a system reset; writing anything
/// else (we use 0x00) releases it.
pub const RESET_REQ_SIGNATURE: u8 = 0x59;

/// Access-protection keys.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Key {
    NvmProg,
    ChipErase,
    UserRowWrite,
}

impl Key {
    /// The fixed 8-byte ASCII key signatures from the UPDI chapter of the
    /// tinyAVR 1-series datasheet ("Key Activation"). Transmitted
    /// least-significant byte first.
    fn signature(self) -> &'static [u8; 8] {
        match self {
            Key::NvmProg => b"NVMProg ",
            Key::ChipErase => b"NVMErase",
            Key::UserRowWrite => b"NVMUs&te",
        }
    }

    /// ASI_KEY_STATUS bit that confirms the target decoded this key.
    pub fn status_bit(self) -> u8 {
        match self {
            Key::NvmProg => KEY_STATUS_NVMPROG_BIT,
            Key::ChipErase => KEY_STATUS_CHIPERASE_BIT,
            Key::UserRowWrite => KEY_STATUS_UROWWRITE_BIT,
        }
    }
}

/// Most repeats a single REPEAT-prefixed instruction can carry with a
/// one-byte count.
pub const MAX_REPEAT: usize = 256;

/// Picks the LDS/STS address-size bits for `address`.
fn addr_size(address: u32) -> (u8, usize) {
    if address > 0xFFFF {
        (ADDR_24, 3)
    } else {
        (ADDR_16, 2)
    }
}

/// Picks the ST-pointer size bits for `address`.
fn ptr_size(address: u32) -> (u8, usize) {
    if address > 0xFFFF {
        (DATA_24, 3)
    } else {
        (DATA_16, 2)
    }
}

fn push_le(frame: &mut Vec<u8>, value: u32, n: usize) {
    frame.extend_from_slice(&value.to_le_bytes()[..n]);
}

/// The UPDI data link. Owns the PHY and is the only place instruction
/// frames are built.
pub struct Link {
    phy: Phy,
    initialized: bool,
    guard_time: u8,
}

impl Link {
    pub fn new(phy: Phy) -> Self {
        Self {
            phy,
            initialized: false,
            guard_time: GUARD_TIME_INIT,
        }
    }

    pub fn phy(&mut self) -> &mut Phy {
        &mut self.phy
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Brings the link up: program the guard time and disable
    /// clock-collision detection (we drive the line from both ends of a
    /// resistor, so collisions are a fact of life), enable the inter-byte
    /// delay, then check that the peripheral answers a STATUSA read.
    pub fn initialize(&mut self) -> Result<()> {
        self.stcs(
            cs::CTRLB,
            (1 << CTRLB_CCDETDIS_BIT) | (self.guard_time & CTRLB_GTVAL_MASK),
        )?;
        self.stcs(cs::CTRLA, 1 << CTRLA_IBDLY_BIT)?;

        let statusa = self.ldcs(cs::STATUSA)?;
        if statusa == 0 {
            return Err(ProtocolError::UnexpectedByte.into());
        }
        debug!("link up, STATUSA={statusa:#04x}");
        self.initialized = true;
        Ok(())
    }

    /// Re-programs the guard time (STCS to CTRLB, preserving the collision
    /// detection disable).
    pub fn set_guard_time(&mut self, cycles: u8) -> Result<()> {
        self.guard_time = cycles & CTRLB_GTVAL_MASK;
        self.stcs(cs::CTRLB, (1 << CTRLB_CCDETDIS_BIT) | self.guard_time)
    }

    /// Loads one byte from control/status register `reg`.
    pub fn ldcs(&mut self, reg: u8) -> Result<u8> {
        self.phy.send(&[SYNC, OP_LDCS | (reg & 0x0F)])?;
        Ok(self.phy.recv(1)?[0])
    }

    /// Stores one byte to control/status register `reg`. STCS is not
    /// acknowledged.
    pub fn stcs(&mut self, reg: u8, value: u8) -> Result<()> {
        self.phy.send(&[SYNC, OP_STCS | (reg & 0x0F), value])
    }

    /// Load direct: 1 or 2 data bytes from `address` (16- or 24-bit
    /// address form chosen by the address value).
    pub fn lds(&mut self, address: u32, size: usize) -> Result<Vec<u8>> {
        debug_assert!(size == 1 || size == 2);
        let (abits, alen) = addr_size(address);
        let dbits = if size == 2 { DATA_16 } else { DATA_8 };
        let mut frame = vec![SYNC, OP_LDS | abits | dbits];
        push_le(&mut frame, address, alen);
        self.phy.send(&frame)?;
        self.phy.recv(size)
    }

    /// Store direct: the two-phase handshake, address then data, with an
    /// ACK expected after each phase.
    pub fn sts(&mut self, address: u32, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() == 1 || data.len() == 2);
        let (abits, alen) = addr_size(address);
        let dbits = if data.len() == 2 { DATA_16 } else { DATA_8 };
        let mut frame = vec![SYNC, OP_STS | abits | dbits];
        push_le(&mut frame, address, alen);
        self.phy.send(&frame)?;
        self.expect_ack()?;
        self.phy.send(data)?;
        self.expect_ack()
    }

    /// Writes the transfer pointer.
    pub fn st_ptr(&mut self, address: u32) -> Result<()> {
        let (sbits, slen) = ptr_size(address);
        let mut frame = vec![SYNC, OP_ST | PTR_ADDR | sbits];
        push_le(&mut frame, address, slen);
        self.phy.send(&frame)?;
        self.expect_ack()
    }

    /// Reads `n` bytes through the pointer with post-increment, REPEAT
    /// batched. `n` must fit one repeat block.
    pub fn ld_ptr_inc_block(&mut self, n: usize) -> Result<Vec<u8>> {
        debug_assert!(n >= 1 && n <= MAX_REPEAT);
        if n > 1 {
            self.repeat(n)?;
        }
        self.phy.send(&[SYNC, OP_LD | PTR_INC | DATA_8])?;
        self.phy.recv(n)
    }

    /// Reads `n` 16-bit words through the pointer with post-increment.
    /// Returns the raw little-endian bytes (2n of them).
    pub fn ld_ptr_inc_block_words(&mut self, n: usize) -> Result<Vec<u8>> {
        debug_assert!(n >= 1 && n <= MAX_REPEAT / 2);
        if n > 1 {
            self.repeat(n)?;
        }
        self.phy.send(&[SYNC, OP_LD | PTR_INC | DATA_16])?;
        self.phy.recv(n * 2)
    }

    /// Writes `data` through the pointer with post-increment, one ACK per
    /// byte, REPEAT batched.
    pub fn st_ptr_inc_block(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(!data.is_empty() && data.len() <= MAX_REPEAT);
        if data.len() > 1 {
            self.repeat(data.len())?;
        }
        self.phy.send(&[SYNC, OP_ST | PTR_INC | DATA_8, data[0]])?;
        self.expect_ack()?;
        for &b in &data[1..] {
            self.phy.send(&[b])?;
            self.expect_ack()?;
        }
        Ok(())
    }

    /// Writes `data` through the pointer as 16-bit words, one ACK per word.
    /// Halves the ACK overhead on page-buffer fills; `data.len()` must be
    /// even.
    pub fn st_ptr_inc_block_words(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(
            !data.is_empty()
                && data.len() % 2 == 0
                && data.len() / 2 <= MAX_REPEAT / 2
        );
        let words = data.len() / 2;
        if words > 1 {
            self.repeat(words)?;
        }
        self.phy
            .send(&[SYNC, OP_ST | PTR_INC | DATA_16, data[0], data[1]])?;
        self.expect_ack()?;
        for word in data[2..].chunks_exact(2) {
            self.phy.send(word)?;
            self.expect_ack()?;
        }
        Ok(())
    }

    /// Transmits an access-protection key.
    pub fn key(&mut self, key: Key) -> Result<()> {
        debug!("sending {key:?} key");
        self.phy.send(&[SYNC, OP_KEY | KEY_SEND | KEY_LEN_64])?;
        // Keys go out least-significant byte first.
        let mut sig = *key.signature();
        sig.reverse();
        self.phy.send(&sig)
    }

    /// Reads the 16-byte System Information Block via the KEY instruction's
    /// SIB variant.
    pub fn read_sib(&mut self) -> Result<[u8; 16]> {
        self.phy.send(&[SYNC, OP_KEY | KEY_SIB | KEY_LEN_128])?;
        let raw = self.phy.recv(16)?;
        let mut sib = [0u8; 16];
        sib.copy_from_slice(&raw);
        Ok(sib)
    }

    /// Emits the REPEAT prefix. Private: callers must go through the block
    /// helpers so nothing can interleave between the prefix and its LD/ST.
    fn repeat(&mut self, count: usize) -> Result<()> {
        debug_assert!(count >= 2 && count <= MAX_REPEAT);
        let n = (count - 1) as u8;
        self.phy.send(&[SYNC, OP_REPEAT | REPEAT_BYTE, n])
    }

    /// Checks a write-phase response. On a bad ACK, makes exactly one
    /// re-sync attempt (BREAK, STATUSA read, guard time re-asserted); if
    /// that fails too the error is upgraded to `DesyncDetected`.
    fn expect_ack(&mut self) -> Result<()> {
        let b = self.phy.recv(1)?[0];
        if b == ACK {
            return Ok(());
        }
        debug!("bad ack {b:#04x}, attempting re-sync");
        match self.resync() {
            Ok(()) => Err(ProtocolError::BadAck(b).into()),
            Err(_) => Err(ProtocolError::DesyncDetected.into()),
        }
    }

    /// One BREAK plus a STATUSA read to get the target's receiver back to
    /// instruction-boundary state. BREAK wipes CTRLB, so the guard time is
    /// re-asserted afterwards.
    fn resync(&mut self) -> Result<()> {
        self.phy.send_break()?;
        let statusa = self.ldcs(cs::STATUSA)?;
        if statusa == 0 {
            return Err(ProtocolError::UnexpectedByte.into());
        }
        self.stcs(
            cs::CTRLB,
            (1 << CTRLB_CCDETDIS_BIT) | (self.guard_time & CTRLB_GTVAL_MASK),
        )
    }

}
