//! The disc command library: the part of a disc controller which
//! executes disc opcodes (seek, read, write, request status and so
//! on) against a drive and its image.
//!
//! An interface front end (such as [`crate::da`]) gathers an opcode
//! and its parameter words into the [`Controller`]'s buffer, then
//! drives execution with [`Controller::prepare_command`],
//! [`Controller::start_command`] and repeated calls to
//! [`Controller::service_drive`], moving data in and out of the
//! buffer between calls.  The controller's [`ControllerState`] says
//! whether the command is still in progress.
use std::fmt::{self, Display, Formatter};

use serde::Serialize;

mod controller;
mod drive;
mod image;
mod model;
#[cfg(test)]
mod tests;

pub use controller::{ClearKind, Controller, ControllerState, Phase};
pub use drive::{Drive, Status2};
pub use image::{DiscImage, ImageStore};
pub use model::{DriveModel, UnknownModel};

/// Words in a sector.
pub const SECTOR_WORDS: usize = 128;

/// Disc opcodes.  The discriminants are the opcode values sent in the
/// upper byte of the first parameter word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Opcode {
    ColdLoadRead = 0o00,
    Recalibrate = 0o01,
    Seek = 0o02,
    RequestStatus = 0o03,
    RequestSectorAddress = 0o04,
    Read = 0o05,
    ReadFullSector = 0o06,
    Verify = 0o07,
    Write = 0o10,
    WriteFullSector = 0o11,
    Clear = 0o12,
    Initialize = 0o13,
    AddressRecord = 0o14,
    RequestSyndrome = 0o15,
    ReadWithOffset = 0o16,
    SetFileMask = 0o17,
    ReadWithoutVerify = 0o22,
}

/// The broad kind of an opcode, which decides how the interface moves
/// its data and how it recovers from an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OpcodeClass {
    /// Data moves from the drive to the host.
    Read,
    /// Data moves from the host to the drive.
    Write,
    /// No data moves.
    Control,
    /// The controller returns status words to the host.
    Status,
}

impl Opcode {
    /// Decodes an opcode byte.  Returns `None` for an illegal opcode.
    pub fn decode(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0o00 => ColdLoadRead,
            0o01 => Recalibrate,
            0o02 => Seek,
            0o03 => RequestStatus,
            0o04 => RequestSectorAddress,
            0o05 => Read,
            0o06 => ReadFullSector,
            0o07 => Verify,
            0o10 => Write,
            0o11 => WriteFullSector,
            0o12 => Clear,
            0o13 => Initialize,
            0o14 => AddressRecord,
            0o15 => RequestSyndrome,
            0o16 => ReadWithOffset,
            0o17 => SetFileMask,
            0o22 => ReadWithoutVerify,
            _ => return None,
        })
    }

    /// The number of parameter words (including the first, which
    /// holds the opcode itself).
    pub fn parameter_words(&self) -> usize {
        match self {
            Opcode::Seek | Opcode::AddressRecord => 3,
            Opcode::Verify | Opcode::ReadWithOffset => 2,
            _ => 1,
        }
    }

    pub fn class(&self) -> OpcodeClass {
        use Opcode::*;
        match self {
            ColdLoadRead | Read | ReadFullSector | ReadWithOffset | ReadWithoutVerify => {
                OpcodeClass::Read
            }
            Write | WriteFullSector | Initialize => OpcodeClass::Write,
            RequestStatus | RequestSectorAddress | RequestSyndrome => OpcodeClass::Status,
            Recalibrate | Seek | Verify | Clear | AddressRecord | SetFileMask => {
                OpcodeClass::Control
            }
        }
    }

    /// True for opcodes which the controller carries out without
    /// touching the drive.
    pub fn is_controller_only(&self) -> bool {
        matches!(
            self,
            Opcode::RequestStatus
                | Opcode::RequestSectorAddress
                | Opcode::RequestSyndrome
                | Opcode::Clear
                | Opcode::AddressRecord
                | Opcode::SetFileMask
        )
    }

    /// True if the low byte of the first parameter word is a unit
    /// number.
    pub fn has_unit_field(&self) -> bool {
        !matches!(self, Opcode::ColdLoadRead | Opcode::SetFileMask)
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use Opcode::*;
        f.write_str(match self {
            ColdLoadRead => "Cold Load Read",
            Recalibrate => "Recalibrate",
            Seek => "Seek",
            RequestStatus => "Request Status",
            RequestSectorAddress => "Request Sector Address",
            Read => "Read",
            ReadFullSector => "Read Full Sector",
            Verify => "Verify",
            Write => "Write",
            WriteFullSector => "Write Full Sector",
            Clear => "Clear",
            Initialize => "Initialize",
            AddressRecord => "Address Record",
            RequestSyndrome => "Request Syndrome",
            ReadWithOffset => "Read With Offset",
            SetFileMask => "Set File Mask",
            ReadWithoutVerify => "Read Without Verify",
        })
    }
}

/// Controller status codes, reported in the upper byte of the first
/// Request Status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatusCode {
    NormalCompletion = 0o00,
    IllegalOpcode = 0o01,
    UnitAvailable = 0o02,
    IllegalDriveType = 0o03,
    CylinderMiscompare = 0o07,
    UncorrectableDataError = 0o10,
    HeadSectorMiscompare = 0o11,
    IoProgramError = 0o12,
    SyncTimeout = 0o13,
    EndOfCylinder = 0o14,
    DataOverrun = 0o16,
    CorrectableDataError = 0o17,
    IllegalSpareAccess = 0o20,
    DefectiveTrack = 0o21,
    AccessNotReady = 0o22,
    Status2Error = 0o23,
    ProtectedTrack = 0o26,
    UnitUnavailable = 0o27,
    DriveAttention = 0o37,
}

impl StatusCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// True for the statuses which end a command successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::NormalCompletion | StatusCode::DriveAttention)
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use StatusCode::*;
        let name = match self {
            NormalCompletion => "normal completion",
            IllegalOpcode => "illegal opcode",
            UnitAvailable => "unit available",
            IllegalDriveType => "illegal drive type",
            CylinderMiscompare => "cylinder miscompare",
            UncorrectableDataError => "uncorrectable data error",
            HeadSectorMiscompare => "head-sector miscompare",
            IoProgramError => "I/O program error",
            SyncTimeout => "sync timeout",
            EndOfCylinder => "end of cylinder",
            DataOverrun => "data overrun",
            CorrectableDataError => "correctable data error",
            IllegalSpareAccess => "illegal spare access",
            DefectiveTrack => "defective track",
            AccessNotReady => "access not ready",
            Status2Error => "status-2 error",
            ProtectedTrack => "protected track",
            UnitUnavailable => "unit unavailable",
            DriveAttention => "drive attention",
        };
        write!(f, "{name} ({:02o})", self.code())
    }
}

/// Decodes the status code in the upper byte of a Request Status
/// word.
impl TryFrom<u8> for StatusCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<StatusCode, u8> {
        use StatusCode::*;
        [
            NormalCompletion,
            IllegalOpcode,
            UnitAvailable,
            IllegalDriveType,
            CylinderMiscompare,
            UncorrectableDataError,
            HeadSectorMiscompare,
            IoProgramError,
            SyncTimeout,
            EndOfCylinder,
            DataOverrun,
            CorrectableDataError,
            IllegalSpareAccess,
            DefectiveTrack,
            AccessNotReady,
            Status2Error,
            ProtectedTrack,
            UnitUnavailable,
            DriveAttention,
        ]
        .into_iter()
        .find(|status| status.code() == code)
        .ok_or(code)
    }
}
