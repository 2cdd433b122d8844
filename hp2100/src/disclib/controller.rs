use std::time::Duration;

use serde::Serialize;
use tracing::{event, Level};

use super::{Drive, Opcode, OpcodeClass, StatusCode, SECTOR_WORDS};
use crate::stop::Stop;

/// Time from the start of a command to its first drive service.
pub const COMMAND_TIME: Duration = Duration::from_micros(25);
/// Time to read or write one sector.
pub const SECTOR_TIME: Duration = Duration::from_micros(200);
const SEEK_SETTLE_TIME: Duration = Duration::from_micros(100);
const SEEK_TIME_PER_CYLINDER: Duration = Duration::from_micros(5);

/// File mask bit: at the end of a cylinder, move the heads to the
/// next one instead of reporting end of cylinder.
pub const INCREMENTAL_SEEK: u8 = 0o2;

/// Words of address information which precede the data of a full
/// sector.
const FULL_SECTOR_HEADER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerState {
    /// No command is in progress.
    Idle,
    /// A command is in progress; the caller must call
    /// [`Controller::service_drive`] again.
    Busy,
}

/// Where a command in progress has got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    /// The command has been accepted but nothing has happened yet.
    Start,
    /// The buffer holds the data to be sent to the host (reads and
    /// status) or is waiting for the data from the host (writes).
    Data,
    /// The drive is moving the heads.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClearKind {
    /// Everything, including the current disc address.
    PowerOn,
    /// The Clear opcode, or a device clear on the bus.
    Device,
}

#[derive(Debug, Clone, Serialize)]
pub struct Controller {
    state: ControllerState,
    phase: Phase,
    status: StatusCode,
    opcode: Option<Opcode>,
    unit: u8,
    /// Parameter words while a command is being set up; data words
    /// once it is in its data phase.
    buffer: Vec<u16>,
    wait: Duration,
    cylinder: u16,
    head: u8,
    sector: u8,
    file_mask: u8,
    end_of_cylinder: bool,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Controller {
        Controller {
            state: ControllerState::Idle,
            phase: Phase::Start,
            status: StatusCode::NormalCompletion,
            opcode: None,
            unit: 0,
            buffer: Vec::new(),
            wait: Duration::ZERO,
            cylinder: 0,
            head: 0,
            sector: 0,
            file_mask: 0,
            end_of_cylinder: false,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn opcode(&self) -> Option<Opcode> {
        self.opcode
    }

    /// How long the caller should wait before the next call to
    /// [`Controller::service_drive`].
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// The disc address the next transfer will use.
    pub fn address(&self) -> (u16, u8, u8) {
        (self.cylinder, self.head, self.sector)
    }

    pub fn file_mask(&self) -> u8 {
        self.file_mask
    }

    pub fn buffer(&self) -> &[u16] {
        &self.buffer
    }

    /// Number of bytes in the buffer.
    pub fn byte_length(&self) -> usize {
        self.buffer.len() * 2
    }

    /// Stores byte `index` of the buffer (upper byte of each word
    /// first), growing the buffer if necessary.
    pub fn load_byte(&mut self, index: usize, byte: u8) {
        let word = index / 2;
        if self.buffer.len() <= word {
            self.buffer.resize(word + 1, 0);
        }
        let value = &mut self.buffer[word];
        *value = if index % 2 == 0 {
            (*value & 0x00FF) | (u16::from(byte) << 8)
        } else {
            (*value & 0xFF00) | u16::from(byte)
        };
    }

    /// Returns byte `index` of the buffer.
    pub fn unload_byte(&self, index: usize) -> Option<u8> {
        self.buffer.get(index / 2).map(|word| {
            if index % 2 == 0 {
                (word >> 8) as u8
            } else {
                (word & 0xFF) as u8
            }
        })
    }

    /// Validates an opcode byte and begins gathering its parameters.
    /// Returns false (with status set to illegal opcode) if the
    /// opcode is not valid.
    pub fn prepare_command(&mut self, byte: u8) -> bool {
        self.buffer.clear();
        self.buffer.push(u16::from(byte) << 8);
        self.phase = Phase::Start;
        match Opcode::decode(byte) {
            Some(opcode) => {
                event!(Level::DEBUG, "{} command prepared", opcode);
                self.opcode = Some(opcode);
                true
            }
            None => {
                event!(Level::DEBUG, "illegal opcode {:03o}", byte);
                self.opcode = None;
                self.status = StatusCode::IllegalOpcode;
                false
            }
        }
    }

    /// The number of parameter bytes the prepared command expects
    /// (including the opcode byte).
    pub fn parameter_bytes(&self) -> usize {
        self.opcode.map_or(0, |opcode| opcode.parameter_words() * 2)
    }

    pub fn classify(&self) -> OpcodeClass {
        self.opcode.map_or(OpcodeClass::Control, |opcode| opcode.class())
    }

    /// Commits to executing the prepared command.  Returns the unit
    /// number, or `None` if the command is rejected (the reason is
    /// left in the status).
    pub fn start_command(&mut self, drive: &Drive) -> Option<usize> {
        let Some(opcode) = self.opcode else {
            self.status = StatusCode::IllegalOpcode;
            return None;
        };
        if self.buffer.len() < opcode.parameter_words() {
            self.status = StatusCode::IoProgramError;
            return None;
        }
        self.unit = if opcode.has_unit_field() {
            (self.buffer[0] & 0x0F) as u8
        } else {
            0
        };
        let rejection = if self.unit != 0 && opcode != Opcode::RequestStatus {
            Some(StatusCode::UnitUnavailable)
        } else if opcode.is_controller_only() {
            None
        } else if !drive.is_ready() {
            Some(StatusCode::AccessNotReady)
        } else if drive.has_errors() {
            Some(StatusCode::Status2Error)
        } else {
            None
        };
        if let Some(status) = rejection {
            event!(Level::DEBUG, "{} rejected: {}", opcode, status);
            self.status = status;
            return None;
        }
        event!(Level::DEBUG, "{} started", opcode);
        self.state = ControllerState::Busy;
        self.phase = Phase::Start;
        self.wait = COMMAND_TIME;
        Some(usize::from(self.unit))
    }

    /// Advances the command in progress by one phase and returns its
    /// status.  When the command is finished the controller is idle
    /// again.  `device` names the unit in any simulation stop.
    pub fn service_drive(&mut self, drive: &mut Drive, device: &str) -> Result<StatusCode, Stop> {
        let Some(opcode) = self.opcode.filter(|_| self.state == ControllerState::Busy) else {
            return Err(Stop::internal(
                device,
                "disc drive serviced with no command in progress",
            ));
        };
        match (opcode.class(), self.phase) {
            (_, Phase::End) => {
                // A seek has finished.
                drive.attention = true;
                Ok(self.finish(opcode, StatusCode::NormalCompletion))
            }
            (OpcodeClass::Read, Phase::Start) => self.start_read(opcode, drive, device),
            (OpcodeClass::Write, Phase::Start) => Ok(self.start_write(opcode, drive)),
            (OpcodeClass::Status, Phase::Start) => Ok(self.report(opcode, drive)),
            (OpcodeClass::Control, Phase::Start) => Ok(self.control(opcode, drive)),
            (OpcodeClass::Read, Phase::Data) => {
                self.advance_address(drive);
                Ok(self.finish(opcode, StatusCode::NormalCompletion))
            }
            (OpcodeClass::Write, Phase::Data) => self.finish_write(opcode, drive, device),
            (OpcodeClass::Status, Phase::Data) => {
                Ok(self.finish(opcode, StatusCode::NormalCompletion))
            }
            (OpcodeClass::Control, Phase::Data) => Err(Stop::internal(
                device,
                format!("{opcode} has no data phase"),
            )),
        }
    }

    /// Ends the command in progress with `status`.
    pub fn end_command(&mut self, status: StatusCode) {
        self.status = status;
        self.state = ControllerState::Idle;
        self.phase = Phase::Start;
        self.wait = Duration::ZERO;
    }

    /// Abandons any command in progress, keeping the status.
    pub fn idle_controller(&mut self) {
        self.state = ControllerState::Idle;
        self.phase = Phase::Start;
        self.wait = Duration::ZERO;
        self.buffer.clear();
    }

    pub fn clear_controller(&mut self, drive: &mut Drive, kind: ClearKind) {
        event!(Level::DEBUG, "controller {:?} clear", kind);
        self.idle_controller();
        self.opcode = None;
        self.status = StatusCode::NormalCompletion;
        self.file_mask = 0;
        self.end_of_cylinder = false;
        drive.fault = false;
        drive.seek_check = false;
        if kind == ClearKind::PowerOn {
            self.cylinder = 0;
            self.head = 0;
            self.sector = 0;
        }
    }

    fn finish(&mut self, opcode: Opcode, status: StatusCode) -> StatusCode {
        if status.is_success() {
            event!(Level::DEBUG, "{} completed", opcode);
        } else {
            event!(Level::DEBUG, "{} failed: {}", opcode, status);
        }
        self.end_command(status);
        status
    }

    fn set_address(&mut self, cylinder: u16, head: u8, sector: u8) {
        self.cylinder = cylinder;
        self.head = head;
        self.sector = sector;
        self.end_of_cylinder = false;
    }

    fn parameter_address(&self) -> (u16, u8, u8) {
        let head_sector = self.buffer[2];
        (self.buffer[1], (head_sector >> 8) as u8, (head_sector & 0xFF) as u8)
    }

    fn start_seek(&mut self, drive: &mut Drive, cylinder: u16) {
        let distance = u32::from(cylinder.abs_diff(drive.cylinder));
        drive.cylinder = cylinder;
        drive.seek_check = false;
        self.phase = Phase::End;
        self.wait = SEEK_SETTLE_TIME + SEEK_TIME_PER_CYLINDER * distance;
    }

    /// Checks that the current address can be transferred.
    fn check_address(&self, drive: &Drive) -> Option<StatusCode> {
        if self.end_of_cylinder {
            Some(StatusCode::EndOfCylinder)
        } else if drive.cylinder != self.cylinder {
            Some(StatusCode::CylinderMiscompare)
        } else if !drive.model.contains(self.cylinder, self.head, self.sector) {
            Some(StatusCode::HeadSectorMiscompare)
        } else {
            None
        }
    }

    fn advance_address(&mut self, drive: &mut Drive) {
        let model = drive.model;
        self.sector += 1;
        if self.sector < model.sectors() {
            return;
        }
        self.sector = 0;
        self.head += 1;
        if self.head < model.heads() {
            return;
        }
        self.head = 0;
        if self.file_mask & INCREMENTAL_SEEK != 0 && self.cylinder + 1 < model.cylinders() {
            self.cylinder += 1;
            drive.cylinder = self.cylinder;
        } else {
            self.end_of_cylinder = true;
        }
    }

    fn start_read(
        &mut self,
        opcode: Opcode,
        drive: &mut Drive,
        device: &str,
    ) -> Result<StatusCode, Stop> {
        if opcode == Opcode::ColdLoadRead {
            let head_sector = (self.buffer[0] & 0xFF) as u8;
            self.set_address(0, head_sector >> 6, head_sector & 0o77);
            drive.cylinder = 0;
        }
        if let Some(status) = self.check_address(drive) {
            return Ok(self.finish(opcode, status));
        }
        let (cylinder, head, sector) = self.address();
        let words = drive
            .read_sector(cylinder, head, sector)
            .map_err(|e| Stop::host_io(device, "sector read", &e))?;
        event!(
            Level::TRACE,
            "{} of cylinder {} head {} sector {}",
            opcode,
            cylinder,
            head,
            sector
        );
        self.buffer.clear();
        if opcode == Opcode::ReadFullSector {
            self.buffer.push(cylinder);
            self.buffer.push(u16::from(head) << 8 | u16::from(sector));
        }
        self.buffer.extend(words);
        self.phase = Phase::Data;
        self.wait = SECTOR_TIME;
        Ok(StatusCode::NormalCompletion)
    }

    fn start_write(&mut self, opcode: Opcode, drive: &Drive) -> StatusCode {
        let refusal = if opcode == Opcode::Initialize && !drive.format {
            Some(StatusCode::Status2Error)
        } else if drive.protect {
            Some(StatusCode::ProtectedTrack)
        } else {
            self.check_address(drive)
        };
        if let Some(status) = refusal {
            return self.finish(opcode, status);
        }
        let words = if opcode == Opcode::WriteFullSector {
            FULL_SECTOR_HEADER + SECTOR_WORDS
        } else {
            SECTOR_WORDS
        };
        self.buffer.clear();
        self.buffer.resize(words, 0);
        self.phase = Phase::Data;
        self.wait = SECTOR_TIME;
        StatusCode::NormalCompletion
    }

    fn finish_write(
        &mut self,
        opcode: Opcode,
        drive: &mut Drive,
        device: &str,
    ) -> Result<StatusCode, Stop> {
        let skip = if opcode == Opcode::WriteFullSector {
            FULL_SECTOR_HEADER
        } else {
            0
        };
        let mut words: Vec<u16> = self.buffer.iter().skip(skip).copied().collect();
        words.resize(SECTOR_WORDS, 0);
        let (cylinder, head, sector) = self.address();
        drive
            .write_sector(cylinder, head, sector, &words)
            .map_err(|e| Stop::host_io(device, "sector write", &e))?;
        event!(
            Level::TRACE,
            "{} of cylinder {} head {} sector {}",
            opcode,
            cylinder,
            head,
            sector
        );
        self.advance_address(drive);
        Ok(self.finish(opcode, StatusCode::NormalCompletion))
    }

    fn report(&mut self, opcode: Opcode, drive: &mut Drive) -> StatusCode {
        let (cylinder, head, sector) = self.address();
        let head_sector = u16::from(head) << 8 | u16::from(sector);
        self.buffer = match opcode {
            Opcode::RequestStatus => {
                let (status, status2) = if self.unit == 0 {
                    (self.status, drive.status2().bits())
                } else {
                    (StatusCode::UnitUnavailable, 0)
                };
                if self.unit == 0 {
                    drive.first_status = false;
                    drive.attention = false;
                    drive.seek_check = false;
                }
                vec![u16::from(status.code()) << 8 | u16::from(self.unit), status2]
            }
            Opcode::RequestSectorAddress => vec![cylinder, head_sector],
            _ => vec![
                u16::from(self.status.code()) << 8 | u16::from(self.unit),
                cylinder,
                head_sector,
                0,
                0,
                0,
                0,
            ],
        };
        self.status = StatusCode::NormalCompletion;
        self.phase = Phase::Data;
        self.wait = COMMAND_TIME;
        StatusCode::NormalCompletion
    }

    fn control(&mut self, opcode: Opcode, drive: &mut Drive) -> StatusCode {
        match opcode {
            Opcode::Seek => {
                let (cylinder, head, sector) = self.parameter_address();
                if !drive.model.contains(cylinder, head, sector) {
                    drive.seek_check = true;
                    drive.attention = true;
                    return self.finish(opcode, StatusCode::Status2Error);
                }
                self.set_address(cylinder, head, sector);
                self.start_seek(drive, cylinder);
                StatusCode::NormalCompletion
            }
            Opcode::Recalibrate => {
                self.set_address(0, 0, 0);
                self.start_seek(drive, 0);
                StatusCode::NormalCompletion
            }
            Opcode::AddressRecord => {
                let (cylinder, head, sector) = self.parameter_address();
                self.set_address(cylinder, head, sector);
                self.finish(opcode, StatusCode::NormalCompletion)
            }
            Opcode::SetFileMask => {
                self.file_mask = (self.buffer[0] & 0x0F) as u8;
                self.finish(opcode, StatusCode::NormalCompletion)
            }
            Opcode::Clear => {
                self.clear_controller(drive, ClearKind::Device);
                self.finish(opcode, StatusCode::NormalCompletion)
            }
            Opcode::Verify => {
                let count = self.buffer[1];
                for _ in 0..count {
                    if let Some(status) = self.check_address(drive) {
                        return self.finish(opcode, status);
                    }
                    self.advance_address(drive);
                }
                self.finish(opcode, StatusCode::NormalCompletion)
            }
            _ => self.finish(opcode, StatusCode::IllegalOpcode),
        }
    }
}
