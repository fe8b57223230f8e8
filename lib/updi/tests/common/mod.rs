// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Behavioral UPDI target model.
//!
//! `SimPort` implements the byte transport the PHY expects, backed by a
//! shared `TargetState` that parses the instruction stream one byte at a
//! time and plays the part of a tinyAVR: 64 KiB data space with flash
//! mapped at the device's flash window, CS register file, key negotiation,
//! reset handling, and NVMCTRL page-buffer semantics. The `Target` handle
//! gives tests direct access to the model for setup, fault injection, and
//! assertions.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use updi::devices::DeviceDescriptor;
use updi::phy::Serial;

const ACK: u8 = 0x40;
const SYNC: u8 = 0x55;

// NVMCTRL offsets, mirrored from the driver's register map.
const NVM_CTRLA: u32 = 0x00;
const NVM_STATUS: u32 = 0x02;
const NVM_DATAL: u32 = 0x06;
const NVM_ADDRL: u32 = 0x08;
const NVM_ADDRH: u32 = 0x09;

// CS register numbers.
const CS_STATUSA: u8 = 0x00;
const CS_CTRLA: u8 = 0x02;
const CS_CTRLB: u8 = 0x03;
const CS_KEY_STATUS: u8 = 0x07;
const CS_RESET_REQ: u8 = 0x08;
const CS_SYS_STATUS: u8 = 0x0B;

const CTRLB_UPDIDIS: u8 = 1 << 2;
const KEY_STATUS_CHIPERASE: u8 = 1 << 3;
const KEY_STATUS_NVMPROG: u8 = 1 << 4;
const KEY_STATUS_UROWWRITE: u8 = 1 << 5;
const SYS_STATUS_NVMPROG: u8 = 1 << 3;
const SYS_STATUS_LOCKSTATUS: u8 = 1 << 0;
const RESET_SIGNATURE: u8 = 0x59;

/// 16-byte SIB the model hands back; `family` parses to "tinyAVR".
pub const SIB: [u8; 16] = *b"tinyAVR P:0D:0-3";

/// 3-byte device ID planted in the signature row.
pub const SIGNATURE: [u8; 3] = [0x1E, 0x93, 0x21];

enum Parser {
    /// Waiting for SYNC.
    Idle,
    /// SYNC seen; next byte is the opcode.
    Opcode,
    /// Collecting `need` operand bytes for `op`.
    Operand { op: u8, need: usize, got: Vec<u8> },
    /// Collecting one store data unit. `addr` is `None` for
    /// pointer-increment stores (which write at the transfer pointer).
    StoreData {
        addr: Option<u32>,
        need: usize,
        got: Vec<u8>,
    },
    /// Collecting the 8 key bytes.
    KeyData { got: Vec<u8> },
}

pub struct TargetState {
    device: DeviceDescriptor,
    pub mem: Vec<u8>,
    cs: [u8; 16],
    ptr: u32,
    /// Extra executions left for the current REPEAT-prefixed instruction.
    repeat: u32,
    /// Pending repeat count for the *next* LD/ST.
    repeat_pending: u32,
    page_buffer: Vec<(u32, u8)>,
    parser: Parser,
    rx: VecDeque<u8>,
    baud: u32,
    pub locked: bool,
    progmode: bool,
    disabled: bool,
    nvmprog_key: bool,
    chiperase_key: bool,
    urow_key: bool,
    pub reset_count: u32,
    pub chip_erase_count: u32,
    // Fault injection.
    /// Replace an upcoming ACK with this byte (after skipping `ack_skip`
    /// good ones).
    pub ack_override: Option<u8>,
    pub ack_skip: u32,
    /// Forced NVMCTRL.STATUS value, overriding the (always-ready) model.
    pub status_value: Option<u8>,
}

impl TargetState {
    fn new(device: DeviceDescriptor) -> Self {
        let mut mem = vec![0u8; 0x1_0000];

        let start = device.flash.start as usize;
        let size = device.flash.size as usize;
        mem[start..start + size].fill(0xFF);

        let sigrow = device.sigrow_address as usize;
        mem[sigrow..sigrow + 3].copy_from_slice(&SIGNATURE);

        let fuses = device.fuses_address as usize;
        mem[fuses..fuses + device.fuse_count as usize].fill(0xFF);

        Self {
            device,
            mem,
            cs: [0; 16],
            ptr: 0,
            repeat: 0,
            repeat_pending: 0,
            page_buffer: Vec::new(),
            parser: Parser::Idle,
            rx: VecDeque::new(),
            baud: 115_200,
            locked: false,
            progmode: false,
            disabled: false,
            nvmprog_key: false,
            chiperase_key: false,
            urow_key: false,
            reset_count: 0,
            chip_erase_count: 0,
            ack_override: None,
            ack_skip: 0,
            status_value: None,
        }
    }

    pub fn flash(&self) -> &[u8] {
        let start = self.device.flash.start as usize;
        &self.mem[start..start + self.device.flash.size as usize]
    }

    pub fn in_progmode(&self) -> bool {
        self.progmode
    }

    fn accept(&mut self, byte: u8) {
        // A low frame at break rate is a BREAK: receiver back to idle,
        // session-programmed CTRL state wiped, interface re-enabled.
        if self.baud <= 2400 && byte == 0x00 {
            self.parser = Parser::Idle;
            self.repeat = 0;
            self.repeat_pending = 0;
            self.cs[CS_CTRLA as usize] = 0;
            self.cs[CS_CTRLB as usize] = 0;
            self.disabled = false;
            return;
        }
        if self.disabled {
            return;
        }

        match std::mem::replace(&mut self.parser, Parser::Idle) {
            Parser::Idle => {
                if byte == SYNC {
                    self.parser = Parser::Opcode;
                }
            }
            Parser::Opcode => self.dispatch(byte),
            Parser::Operand { op, need, mut got } => {
                got.push(byte);
                if got.len() == need {
                    self.operand_complete(op, got);
                } else {
                    self.parser = Parser::Operand { op, need, got };
                }
            }
            Parser::StoreData { addr, need, mut got } => {
                got.push(byte);
                if got.len() == need {
                    self.store_unit(addr, &got);
                    self.push_ack();
                    if addr.is_none() && self.repeat > 0 {
                        self.repeat -= 1;
                        self.parser = Parser::StoreData {
                            addr: None,
                            need,
                            got: Vec::new(),
                        };
                    }
                } else {
                    self.parser = Parser::StoreData { addr, need, got };
                }
            }
            Parser::KeyData { mut got } => {
                got.push(byte);
                if got.len() == 8 {
                    self.key_complete(&got);
                } else {
                    self.parser = Parser::KeyData { got };
                }
            }
        }
    }

    fn dispatch(&mut self, op: u8) {
        let repeat = std::mem::take(&mut self.repeat_pending);
        match op & 0xE0 {
            // LDCS
            0x80 => {
                let v = self.read_cs(op & 0x0F);
                self.rx.push_back(v);
            }
            // STCS
            0xC0 => {
                self.parser = Parser::Operand {
                    op,
                    need: 1,
                    got: Vec::new(),
                };
            }
            // LDS
            0x00 => {
                self.parser = Parser::Operand {
                    op,
                    need: ((op >> 2) & 3) as usize + 1,
                    got: Vec::new(),
                };
            }
            // STS: address operand first, data handshake after.
            0x40 => {
                self.parser = Parser::Operand {
                    op,
                    need: ((op >> 2) & 3) as usize + 1,
                    got: Vec::new(),
                };
            }
            // LD via pointer.
            0x20 => {
                let size = (op & 3) as usize + 1;
                let inc = (op >> 2) & 3 == 1;
                for _ in 0..=repeat {
                    for i in 0..size {
                        let a = (self.ptr + i as u32) as usize & 0xFFFF;
                        let v = self.read_data_byte(a as u32);
                        self.rx.push_back(v);
                    }
                    if inc {
                        self.ptr += size as u32;
                    }
                }
            }
            // ST via pointer: pointer write or data store.
            0x60 => {
                let size = (op & 3) as usize + 1;
                match (op >> 2) & 3 {
                    // Pointer write.
                    2 => {
                        self.parser = Parser::Operand {
                            op,
                            need: size,
                            got: Vec::new(),
                        };
                    }
                    // Post-increment store.
                    1 => {
                        self.repeat = repeat;
                        self.parser = Parser::StoreData {
                            addr: None,
                            need: size,
                            got: Vec::new(),
                        };
                    }
                    _ => {}
                }
            }
            // REPEAT
            0xA0 => {
                self.parser = Parser::Operand {
                    op,
                    need: (op & 3) as usize + 1,
                    got: Vec::new(),
                };
            }
            // KEY
            0xE0 => {
                if op & 0x04 != 0 {
                    let n = if op & 3 == 1 { 16 } else { 8 };
                    for &b in SIB.iter().take(n) {
                        self.rx.push_back(b);
                    }
                } else {
                    self.parser = Parser::KeyData { got: Vec::new() };
                }
            }
            _ => {}
        }
    }

    fn operand_complete(&mut self, op: u8, got: Vec<u8>) {
        let value = got
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        match op & 0xE0 {
            // STCS
            0xC0 => self.write_cs(op & 0x0F, got[0]),
            // LDS: answer with data bytes.
            0x00 => {
                let size = (op & 3) as usize + 1;
                for i in 0..size {
                    let v = self.read_data_byte(value + i as u32);
                    self.rx.push_back(v);
                }
            }
            // STS: ACK the address, then expect the data unit.
            0x40 => {
                self.push_ack();
                self.parser = Parser::StoreData {
                    addr: Some(value),
                    need: (op & 3) as usize + 1,
                    got: Vec::new(),
                };
            }
            // ST pointer write.
            0x60 => {
                self.ptr = value;
                self.push_ack();
            }
            // REPEAT count.
            0xA0 => self.repeat_pending = value,
            _ => {}
        }
    }

    fn key_complete(&mut self, got: &[u8]) {
        // Keys travel LSB first; undo that before comparing.
        let mut key = [0u8; 8];
        for (i, &b) in got.iter().enumerate() {
            key[7 - i] = b;
        }
        match &key {
            b"NVMProg " => self.nvmprog_key = true,
            b"NVMErase" => self.chiperase_key = true,
            b"NVMUs&te" => self.urow_key = true,
            _ => {}
        }
    }

    fn read_cs(&mut self, reg: u8) -> u8 {
        match reg {
            // Nonzero revision ID so the link-up check passes.
            CS_STATUSA => 0x30,
            CS_KEY_STATUS => {
                let mut v = 0;
                if self.chiperase_key {
                    v |= KEY_STATUS_CHIPERASE;
                }
                if self.nvmprog_key {
                    v |= KEY_STATUS_NVMPROG;
                }
                if self.urow_key {
                    v |= KEY_STATUS_UROWWRITE;
                }
                v
            }
            CS_SYS_STATUS => {
                let mut v = 0;
                if self.progmode {
                    v |= SYS_STATUS_NVMPROG;
                }
                if self.locked {
                    v |= SYS_STATUS_LOCKSTATUS;
                }
                v
            }
            _ => self.cs[reg as usize],
        }
    }

    fn write_cs(&mut self, reg: u8, value: u8) {
        self.cs[reg as usize] = value;
        match reg {
            CS_RESET_REQ => {
                if value == RESET_SIGNATURE {
                    self.reset_count += 1;
                } else {
                    self.release_reset();
                }
            }
            CS_CTRLB => {
                if value & CTRLB_UPDIDIS != 0 {
                    self.disabled = true;
                }
            }
            _ => {}
        }
    }

    /// Reset release applies whatever keys were loaded, then forgets them,
    /// like the hardware does.
    fn release_reset(&mut self) {
        if self.chiperase_key {
            self.erase_chip();
            self.locked = false;
        }
        self.progmode = self.nvmprog_key && !self.locked;
        self.nvmprog_key = false;
        self.chiperase_key = false;
        self.urow_key = false;
    }

    fn read_data_byte(&mut self, address: u32) -> u8 {
        let nvmctrl = u32::from(self.device.nvmctrl_address);
        if address == nvmctrl + NVM_STATUS {
            // The model completes NVM work instantly, so STATUS reads as
            // ready unless a test pins it.
            return self.status_value.unwrap_or(0);
        }
        self.mem[address as usize & 0xFFFF]
    }

    fn store_unit(&mut self, addr: Option<u32>, data: &[u8]) {
        match addr {
            Some(a) => {
                for (i, &b) in data.iter().enumerate() {
                    self.store_byte(a + i as u32, b);
                }
            }
            None => {
                for &b in data {
                    let a = self.ptr;
                    self.ptr += 1;
                    self.store_byte(a, b);
                }
            }
        }
    }

    fn store_byte(&mut self, address: u32, value: u8) {
        let address = address & 0xFFFF;
        let flash = self.device.flash;
        if address >= flash.start && address < flash.start + flash.size {
            // Flash-window writes land in the page buffer until a command
            // commits them.
            self.page_buffer.push((address, value));
            return;
        }
        self.mem[address as usize] = value;

        let nvmctrl = u32::from(self.device.nvmctrl_address);
        if address == nvmctrl + NVM_CTRLA {
            self.nvm_command(value);
        }
    }

    fn nvm_command(&mut self, command: u8) {
        match command {
            // Page buffer clear.
            0x04 => self.page_buffer.clear(),
            // Write page: programming can only clear bits.
            0x01 => {
                for (a, v) in std::mem::take(&mut self.page_buffer) {
                    self.mem[a as usize] &= v;
                }
            }
            // Erase-write page: erase every touched page, then program.
            0x03 => {
                let mask = !(self.device.flash.page_size - 1);
                let staged = std::mem::take(&mut self.page_buffer);
                let mut pages: Vec<u32> =
                    staged.iter().map(|&(a, _)| a & mask).collect();
                pages.sort_unstable();
                pages.dedup();
                for page in pages {
                    let p = page as usize;
                    self.mem[p..p + self.device.flash.page_size as usize]
                        .fill(0xFF);
                }
                for (a, v) in staged {
                    self.mem[a as usize] = v;
                }
            }
            // Chip erase.
            0x05 => self.erase_chip(),
            // Write fuse: target address and value from ADDR/DATA.
            0x07 => {
                let nvmctrl = u32::from(self.device.nvmctrl_address);
                let lo = self.mem[(nvmctrl + NVM_ADDRL) as usize];
                let hi = self.mem[(nvmctrl + NVM_ADDRH) as usize];
                let value = self.mem[(nvmctrl + NVM_DATAL) as usize];
                let addr = u16::from_le_bytes([lo, hi]);
                self.mem[addr as usize] = value;
            }
            _ => {}
        }
    }

    fn erase_chip(&mut self) {
        self.chip_erase_count += 1;
        let start = self.device.flash.start as usize;
        let size = self.device.flash.size as usize;
        self.mem[start..start + size].fill(0xFF);
        let urow = self.device.userrow_address as usize;
        self.mem[urow..urow + 64].fill(0xFF);
        self.page_buffer.clear();
    }

    fn push_ack(&mut self) {
        let byte = match self.ack_override {
            Some(v) if self.ack_skip == 0 => {
                self.ack_override = None;
                v
            }
            Some(_) => {
                self.ack_skip -= 1;
                ACK
            }
            None => ACK,
        };
        self.rx.push_back(byte);
    }
}

/// The transport half handed to the driver.
pub struct SimPort {
    state: Rc<RefCell<TargetState>>,
}

impl Serial for SimPort {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut t = self.state.borrow_mut();
        for &b in data {
            // Shared line: everything we receive is also echoed back.
            t.rx.push_back(b);
            t.accept(b);
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut t = self.state.borrow_mut();
        for slot in buf.iter_mut() {
            *slot = t.rx.pop_front().ok_or_else(|| {
                io::Error::new(io::ErrorKind::TimedOut, "line idle")
            })?;
        }
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.state.borrow_mut().baud = baud;
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}

/// Test-side handle to the model.
#[derive(Clone)]
pub struct Target {
    state: Rc<RefCell<TargetState>>,
}

impl Target {
    pub fn with<R>(&self, f: impl FnOnce(&mut TargetState) -> R) -> R {
        f(&mut self.state.borrow_mut())
    }

    pub fn flash(&self) -> Vec<u8> {
        self.state.borrow().flash().to_vec()
    }

    pub fn mem(&self, address: u32, len: usize) -> Vec<u8> {
        let t = self.state.borrow();
        t.mem[address as usize..address as usize + len].to_vec()
    }

    pub fn poke(&self, address: u32, data: &[u8]) {
        let mut t = self.state.borrow_mut();
        let a = address as usize;
        t.mem[a..a + data.len()].copy_from_slice(data);
    }

    pub fn set_locked(&self, locked: bool) {
        self.state.borrow_mut().locked = locked;
    }

    pub fn in_progmode(&self) -> bool {
        self.state.borrow().in_progmode()
    }

    pub fn reset_count(&self) -> u32 {
        self.state.borrow().reset_count
    }

    pub fn inject_bad_ack(&self, skip: u32, value: u8) {
        let mut t = self.state.borrow_mut();
        t.ack_skip = skip;
        t.ack_override = Some(value);
    }

    pub fn pin_status(&self, value: Option<u8>) {
        self.state.borrow_mut().status_value = value;
    }
}

/// Builds a fresh target model for `device` and the port to drive it with.
pub fn new_target(device: &DeviceDescriptor) -> (SimPort, Target) {
    let state = Rc::new(RefCell::new(TargetState::new(*device)));
    (
        SimPort {
            state: Rc::clone(&state),
        },
        Target { state },
    )
}
