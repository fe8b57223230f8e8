// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NVM controller programming, and the public programmer handle.
//!
//! The NVMCTRL peripheral takes commands through CTRLA and reports busy and
//! error state through STATUS. The sequencing rule for every command is the
//! same: wait until the controller is ready, stage whatever data the
//! command consumes (page buffer via writes into the mapped flash region,
//! or the ADDR/DATA registers for fuses), write the command, wait ready
//! again, then check WRERROR.

use log::{debug, info};

use crate::devices::{DeviceDescriptor, FlashInfo};
use crate::error::{InputError, NvmError, Result};
use crate::link::Link;
use crate::phy::{Phy, Serial, TtyPort};
use crate::session::{Session, Sib};

// NVMCTRL register offsets. The interrupt and high-byte registers are
// listed for completeness; this driver only polls.
const NVMCTRL_CTRLA: u32 = 0x00;
#[allow(dead_code)]
const NVMCTRL_CTRLB: u32 = 0x01;
const NVMCTRL_STATUS: u32 = 0x02;
#[allow(dead_code)]
const NVMCTRL_INTCTRL: u32 = 0x03;
#[allow(dead_code)]
const NVMCTRL_INTFLAGS: u32 = 0x04;
const NVMCTRL_DATAL: u32 = 0x06;
#[allow(dead_code)]
const NVMCTRL_DATAH: u32 = 0x07;
const NVMCTRL_ADDRL: u32 = 0x08;
const NVMCTRL_ADDRH: u32 = 0x09;

// NVMCTRL.STATUS bits.
const STATUS_FBUSY_BIT: u8 = 0;
const STATUS_EEBUSY_BIT: u8 = 1;
const STATUS_WRERROR_BIT: u8 = 2;

/// Poll bound for [`Nvm::wait_ready`]. The slowest operation this gates is
/// chip erase, which finishes well inside this many status reads.
const READY_POLL_BOUND: u32 = 10_000;

/// NVMCTRL v0 command set (CTRLA values).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NvmCommand {
    Nop = 0x00,
    WriteFlashPage = 0x01,
    EraseFlashPage = 0x02,
    EraseWriteFlashPage = 0x03,
    EraseFlashBuffer = 0x04,
    EraseChip = 0x05,
    EraseEeprom = 0x06,
    WriteFuse = 0x07,
}

/// Everything `get_device_info` learns about the target.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub sib: Sib,
    /// 3-byte device ID from the signature row.
    pub signature: [u8; 3],
    /// Current fuse values, indexed by fuse number.
    pub fuses: Vec<u8>,
}

/// The programmer handle: owns the whole stack (port, PHY, link, session)
/// for the lifetime of one exclusive session.
pub struct Nvm {
    session: Session,
    closed: bool,
}

impl Nvm {
    /// Opens a session over an already-open transport and runs the
    /// initialization handshake.
    pub fn open(
        port: Box<dyn Serial>,
        baud: u32,
        device: &DeviceDescriptor,
    ) -> Result<Self> {
        let phy = Phy::new(port, baud)?;
        let mut session = Session::new(Link::new(phy), *device);
        session.init()?;
        Ok(Self {
            session,
            closed: false,
        })
    }

    /// Opens `port_path` as a real serial port at `baud` and starts a
    /// session on it.
    pub fn open_port(
        port_path: &str,
        baud: u32,
        device: &DeviceDescriptor,
    ) -> Result<Self> {
        let port = TtyPort::open(port_path, baud)?;
        Self::open(Box::new(port), baud, device)
    }

    /// Ends the session: best-effort progmode exit, then the port closes
    /// with the drop.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            if self.session.in_progmode_cached() {
                let _ = self.session.leave_progmode();
            }
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        self.session.device()
    }

    pub fn get_flash_info(&self) -> FlashInfo {
        self.session.device().flash
    }

    /// Reads SIB, device signature, and the fuse map.
    pub fn get_device_info(&mut self) -> Result<DeviceInfo> {
        let device = *self.session.device();
        let sib = self
            .session
            .sib()
            .cloned()
            .ok_or(crate::error::StateError::NotInitialized)?;

        let raw = self
            .session
            .read_data(u32::from(device.sigrow_address), 3)?;
        let signature = [raw[0], raw[1], raw[2]];

        let fuses = self.session.read_data(
            u32::from(device.fuses_address),
            usize::from(device.fuse_count),
        )?;

        info!(
            "device {}: signature {:02x} {:02x} {:02x}",
            device.name, signature[0], signature[1], signature[2]
        );
        Ok(DeviceInfo {
            sib,
            signature,
            fuses,
        })
    }

    /// Enters NVM programming mode. `Nvm(Locked)` means the device must be
    /// erase-unlocked first.
    pub fn enter_progmode(&mut self) -> Result<()> {
        self.session.enter_progmode()
    }

    pub fn leave_progmode(&mut self) -> Result<()> {
        self.session.leave_progmode()
    }

    /// Raises (or lowers) the link baud rate, re-initializing the session
    /// at the new speed.
    pub fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.session.set_baud(baud)
    }

    /// Erase-unlocks a locked device and enters programming mode. This
    /// wipes flash, EEPROM, and the lock bits.
    pub fn unlock(&mut self) -> Result<()> {
        self.session.unlock()?;
        self.session.enter_progmode()
    }

    /// Erases flash, EEPROM (unless fuse-protected), and lock bits.
    pub fn chip_erase(&mut self) -> Result<()> {
        self.session.require_progmode()?;
        info!("chip erase");
        self.wait_ready()?;
        self.execute_command(NvmCommand::EraseChip)?;
        self.wait_ready()
    }

    /// Reads `len` bytes of flash starting at mapped address `address`.
    pub fn read_flash(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.check_flash_range(address, len, false)?;
        self.session.read_data(address, len)
    }

    /// Programs flash at mapped address `address`. The region must start on
    /// a page boundary and cover whole pages (callers pad with 0xFF); each
    /// page goes through the buffer-clear / fill / erase-write sequence.
    pub fn write_flash(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.session.require_progmode()?;
        self.check_flash_range(address, data.len(), true)?;

        let page_size = self.session.device().flash.page_size as usize;
        let mut address = address;
        for page in data.chunks(page_size) {
            self.write_flash_page(address, page)?;
            address += page.len() as u32;
        }
        Ok(())
    }

    /// Raw data-space read.
    pub fn read_mem(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.session.read_data(address, len)
    }

    /// Raw data-space write (byte access, ACK checked per byte).
    pub fn write_mem(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.session.write_data(address, data)
    }

    /// Writes one fuse. Fuses cannot be written as ordinary data; the
    /// controller takes the target address and value through its ADDR and
    /// DATA registers and a WriteFuse command.
    pub fn write_fuse(&mut self, fuse: u8, value: u8) -> Result<()> {
        self.session.require_progmode()?;
        let device = *self.session.device();
        if fuse >= device.fuse_count {
            return Err(InputError::BadFuseIndex.into());
        }

        let fuse_address = u32::from(device.fuses_address) + u32::from(fuse);
        let nvmctrl = u32::from(device.nvmctrl_address);
        debug!("write fuse {fuse} @ {fuse_address:#06x} = {value:#04x}");

        self.wait_ready()?;
        self.session
            .write_byte(nvmctrl + NVMCTRL_ADDRL, fuse_address as u8)?;
        self.session
            .write_byte(nvmctrl + NVMCTRL_ADDRH, (fuse_address >> 8) as u8)?;
        self.session
            .write_byte(nvmctrl + NVMCTRL_DATAL, value)?;
        self.execute_command(NvmCommand::WriteFuse)?;
        self.wait_ready()
    }

    /// One flash page: clear the page buffer, fill it with word writes
    /// through the mapped region, then commit with erase-write.
    fn write_flash_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        debug!("flash page @ {address:#06x} ({} bytes)", data.len());
        self.wait_ready()?;
        self.execute_command(NvmCommand::EraseFlashBuffer)?;
        self.wait_ready()?;

        self.session.write_data_words(address, data)?;

        self.execute_command(NvmCommand::EraseWriteFlashPage)?;
        self.wait_ready()
    }

    /// Writes a command into NVMCTRL.CTRLA. Callers hold the ready
    /// invariant: the controller must have reported ready since the last
    /// command.
    fn execute_command(&mut self, command: NvmCommand) -> Result<()> {
        let nvmctrl = u32::from(self.session.device().nvmctrl_address);
        self.session
            .write_byte(nvmctrl + NVMCTRL_CTRLA, command as u8)
    }

    /// Polls NVMCTRL.STATUS until both busy flags clear, within a bounded
    /// number of reads. WRERROR is checked on every read so a failed write
    /// surfaces as `WriteError` rather than a timeout.
    fn wait_ready(&mut self) -> Result<()> {
        let status_addr =
            u32::from(self.session.device().nvmctrl_address) + NVMCTRL_STATUS;
        for _ in 0..READY_POLL_BOUND {
            let status = self.session.read_byte(status_addr)?;
            if status & (1 << STATUS_WRERROR_BIT) != 0 {
                return Err(NvmError::WriteError.into());
            }
            if status & ((1 << STATUS_FBUSY_BIT) | (1 << STATUS_EEBUSY_BIT))
                == 0
            {
                return Ok(());
            }
        }
        Err(NvmError::Busy.into())
    }

    /// Validates a flash access against the device geometry. Writes must
    /// additionally be page aligned.
    fn check_flash_range(
        &self,
        address: u32,
        len: usize,
        write: bool,
    ) -> Result<()> {
        let flash = self.session.device().flash;
        let end = u64::from(address) + len as u64;
        if address < flash.start || end > u64::from(flash.start + flash.size) {
            return Err(InputError::AddressOutOfRange.into());
        }
        if write {
            let page = u64::from(flash.page_size);
            if u64::from(address - flash.start) % page != 0
                || len as u64 % page != 0
                || len == 0
            {
                return Err(InputError::Alignment.into());
            }
        }
        Ok(())
    }
}

impl Drop for Nvm {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Nvm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nvm")
            .field("device", &self.session.device().name)
            .field("progmode", &self.session.in_progmode_cached())
            .finish()
    }
}
