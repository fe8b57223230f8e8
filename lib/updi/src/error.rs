// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy for the UPDI stack.
//!
//! Each layer has its own error enum; `Error` wraps them all so callers can
//! match on the failure class without caring which layer tripped. Errors are
//! reported, never retried internally, with two exceptions that are part of
//! the protocol itself: the bounded NVM ready poll and the single re-sync
//! attempt the link layer makes after a bad ACK.

use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures of the serial byte transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// The port did not produce the expected bytes within the deadline.
    Timeout,
    /// The bytes echoed back on the shared line did not match what we sent.
    /// Usually a wiring problem, or another driver fighting us for the pin.
    EchoMismatch,
    /// The underlying port went away or could not be opened.
    PortClosed,
}

/// Violations of the UPDI on-wire protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// A store phase was answered with something other than the ACK byte
    /// (0x40). Carries the byte we actually received.
    BadAck(u8),
    /// The target answered, but not with anything the current instruction
    /// allows.
    UnexpectedByte,
    /// A bad ACK was followed by a failed re-sync attempt; the link can no
    /// longer be trusted until the session is re-initialized.
    DesyncDetected,
}

/// Session lifecycle misuse.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateError {
    /// The session has not completed its initialization handshake.
    NotInitialized,
    /// The requested operation needs NVM programming mode.
    NotInProgmode,
    /// Program mode was requested while already active.
    AlreadyInProgmode,
    /// The NVMPROG key was accepted but the device never reported program
    /// mode within the retry budget.
    EnterProgmodeFailed,
    /// The CHIPERASE key unlock sequence did not clear the lock status
    /// within the retry budget.
    UnlockFailed,
}

/// Failures reported by, or on behalf of, the NVM controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NvmError {
    /// The controller stayed busy past the poll bound.
    Busy,
    /// The controller flagged WRERROR after a command.
    WriteError,
    /// The device is locked; programming requires an erase-unlock first.
    Locked,
    /// The controller refused the command sequence.
    CommandRejected,
}

/// Caller-supplied arguments that cannot be carried out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InputError {
    /// Address or address+length falls outside the addressed region.
    AddressOutOfRange,
    /// Flash writes must start on a page boundary and cover whole pages.
    Alignment,
    /// The device name is not in the catalog.
    UnknownDevice,
    /// Fuse index is past the device's fuse map.
    BadFuseIndex,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Transport(TransportError),
    Protocol(ProtocolError),
    State(StateError),
    Nvm(NvmError),
    Input(InputError),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<StateError> for Error {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<NvmError> for Error {
    fn from(e: NvmError) -> Self {
        Self::Nvm(e)
    }
}

impl From<InputError> for Error {
    fn from(e: InputError) -> Self {
        Self::Input(e)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("serial read timed out"),
            Self::EchoMismatch => {
                f.write_str("echo readback did not match transmitted bytes")
            }
            Self::PortClosed => f.write_str("serial port closed or unusable"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAck(b) => {
                write!(f, "expected ACK (0x40), target answered {b:#04x}")
            }
            Self::UnexpectedByte => {
                f.write_str("unexpected byte in instruction response")
            }
            Self::DesyncDetected => {
                f.write_str("link desynchronized; re-sync failed")
            }
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => f.write_str("session not initialized"),
            Self::NotInProgmode => {
                f.write_str("operation requires NVM programming mode")
            }
            Self::AlreadyInProgmode => {
                f.write_str("already in NVM programming mode")
            }
            Self::EnterProgmodeFailed => {
                f.write_str("device never entered programming mode")
            }
            Self::UnlockFailed => {
                f.write_str("erase-unlock did not clear the lock status")
            }
        }
    }
}

impl fmt::Display for NvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => f.write_str("NVM controller stayed busy"),
            Self::WriteError => f.write_str("NVM controller reported WRERROR"),
            Self::Locked => f.write_str("device is locked"),
            Self::CommandRejected => {
                f.write_str("NVM controller rejected the command")
            }
        }
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressOutOfRange => f.write_str("address out of range"),
            Self::Alignment => f.write_str("address or length not page aligned"),
            Self::UnknownDevice => f.write_str("unknown device"),
            Self::BadFuseIndex => f.write_str("fuse index out of range"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::State(e) => write!(f, "state: {e}"),
            Self::Nvm(e) => write!(f, "nvm: {e}"),
            Self::Input(e) => write!(f, "input: {e}"),
        }
    }
}

impl std::error::Error for Error {}
