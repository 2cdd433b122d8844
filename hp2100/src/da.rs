//! The Amigo disc front end (DA): up to four HP 7906, 7920 or 7925
//! drives attached to the HP-IB bus of a 12821A Disc Interface.
//!
//! Each drive has an integral controller and recognises the Amigo
//! secondary addresses:
//!
//! | Secondary | As listener              | As talker                |
//! | --------- | ------------------------ | ------------------------ |
//! | 0x00      | receive write data       | send read data           |
//! | 0x08      | receive disc command     | send status              |
//! | 0x09      | CRC listen               | CRC talk                 |
//! | 0x10      | Amigo Clear              | Device-Specified Jump    |
//! | 0x1E      | write loopback           | read loopback            |
//! | 0x1F      | initiate self-test       | return self-test result  |
//!
//! A secondary equal to the drive's own bus address, sent while no
//! device is addressed, is Amigo Identify.
//!
//! The interface state of each unit moves through a disc command
//! like this:
//!
//! ```text
//! idle -L08-> opcode_wait -opcode-> parameter_wait -params+EOI->
//!     read_wait   -T00-> read_xfer  -> idle
//!     write_wait  -L00-> write_xfer -> idle
//!     status_wait -T08-> command_exec -> command_wait -> read_xfer -> idle
//!     command_exec -> command_wait -> idle         (no data)
//! ```
//!
//! A protocol error sends the unit to error_source (one byte with EOI
//! for a host that is waiting to read) or error_sink (discarding
//! bytes until EOI or unlisten).
use std::any::Any;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use serde::Serialize;
use tracing::{event, span, Level};

use base::prelude::*;

use crate::context::Context;
use crate::di::{CardConfiguration, CardReport, DiCard};
use crate::disclib::{
    ClearKind, Controller, ControllerState, DiscImage, Drive, DriveModel, OpcodeClass, Phase,
    StatusCode,
};
use crate::event::EventQueue;
use crate::hpib::{BusCommand, BusLines, BusParticipant, Originator, DCL, SDC};
use crate::io::IoCard;
use crate::stop::Stop;

#[cfg(test)]
mod tests;

/// Number of drives one interface supports.
pub const UNITS: usize = 4;

/// The delay before a unit acts on something the bus did.
pub const DATA_TIME: Duration = Duration::from_micros(2);

const LOOPBACK_BYTES: usize = 16;

/// DSJ values.
const DSJ_NORMAL: u8 = 0;
const DSJ_ERROR: u8 = 1;
const DSJ_POWER_ON: u8 = 2;

const DEFAULT_ADDRESSES: [BusAddress; UNITS] = [
    bus_address!(0),
    bus_address!(1),
    bus_address!(2),
    bus_address!(3),
];

/// The bus address a unit has until it is configured otherwise.
pub fn default_address(unit: usize) -> Option<BusAddress> {
    DEFAULT_ADDRESSES.get(unit).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InterfaceState {
    Idle,
    OpcodeWait,
    ParameterWait,
    ReadWait,
    WriteWait,
    StatusWait,
    CommandExec,
    CommandWait,
    ReadXfer,
    WriteXfer,
    ErrorSource,
    ErrorSink,
}

impl Display for InterfaceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use InterfaceState::*;
        f.write_str(match self {
            Idle => "idle",
            OpcodeWait => "opcode wait",
            ParameterWait => "parameter wait",
            ReadWait => "read wait",
            WriteWait => "write wait",
            StatusWait => "status wait",
            CommandExec => "command execution",
            CommandWait => "command wait",
            ReadXfer => "read transfer",
            WriteXfer => "write transfer",
            ErrorSource => "error source",
            ErrorSink => "error sink",
        })
    }
}

/// The interface command a unit is carrying out, as selected by the
/// last secondary address it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InterfaceCommand {
    Invalid,
    DiscCommand,
    WriteData,
    CrcListen,
    AmigoClear,
    WriteLoopback,
    InitiateSelfTest,
    ReadData,
    SendStatus,
    CrcTalk,
    Dsj,
    ReadLoopback,
    ReturnSelfTestResult,
    AmigoIdentify,
}

impl InterfaceCommand {
    fn decode(secondary: u8, listening: bool) -> InterfaceCommand {
        use InterfaceCommand::*;
        match (listening, secondary) {
            (true, 0x00) => WriteData,
            (true, 0x08) => DiscCommand,
            (true, 0x09) => CrcListen,
            (true, 0x10) => AmigoClear,
            (true, 0x1E) => WriteLoopback,
            (true, 0x1F) => InitiateSelfTest,
            (false, 0x00) => ReadData,
            (false, 0x08) => SendStatus,
            (false, 0x09) => CrcTalk,
            (false, 0x10) => Dsj,
            (false, 0x1E) => ReadLoopback,
            (false, 0x1F) => ReturnSelfTestResult,
            _ => Invalid,
        }
    }

    /// Commands whose result the unit sends as a talker.
    fn sources_data(self) -> bool {
        use InterfaceCommand::*;
        matches!(
            self,
            ReadData
                | SendStatus
                | CrcTalk
                | Dsj
                | ReadLoopback
                | ReturnSelfTestResult
                | AmigoIdentify
        )
    }
}

impl Display for InterfaceCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use InterfaceCommand::*;
        f.write_str(match self {
            Invalid => "invalid",
            DiscCommand => "disc command",
            WriteData => "write data",
            CrcListen => "CRC listen",
            AmigoClear => "Amigo clear",
            WriteLoopback => "write loopback",
            InitiateSelfTest => "initiate self-test",
            ReadData => "read data",
            SendStatus => "send status",
            CrcTalk => "CRC talk",
            Dsj => "DSJ",
            ReadLoopback => "read loopback",
            ReturnSelfTestResult => "return self-test result",
            AmigoIdentify => "Amigo identify",
        })
    }
}

/// The switch settings of one drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscConfiguration {
    pub address: BusAddress,
    pub model: DriveModel,
    pub protect: bool,
    pub format: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    NoSuchUnit(usize),
    DuplicateAddress { unit: usize, address: BusAddress },
    AlreadyAttached(usize),
    NotAttached(usize),
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::NoSuchUnit(unit) => {
                write!(f, "there is no unit {unit} (units are 0 to {})", UNITS - 1)
            }
            ConfigurationError::DuplicateAddress { unit, address } => {
                write!(f, "bus address {address} is already used by unit {unit}")
            }
            ConfigurationError::AlreadyAttached(unit) => write!(f, "unit {unit} is attached"),
            ConfigurationError::NotAttached(unit) => write!(f, "unit {unit} is not attached"),
        }
    }
}

impl Error for ConfigurationError {}

#[derive(Debug)]
struct DaUnit {
    number: usize,
    address: BusAddress,
    drive: Drive,
    controller: Controller,
    state: InterfaceState,
    command: InterfaceCommand,
    dsj: u8,
    /// Bytes moved so far in the current phase.
    count: usize,
    /// Bytes to send, for transfers which don't come from the disc.
    data: Vec<u8>,
    /// The host ended a data transfer early, or the last byte has
    /// arrived.
    end_of_data: bool,
    loopback: [u8; LOOPBACK_BYTES],
    self_test: u8,
}

impl DaUnit {
    fn new(number: usize, address: BusAddress) -> DaUnit {
        DaUnit {
            number,
            address,
            drive: Drive::new(DriveModel::default()),
            controller: Controller::new(),
            state: InterfaceState::Idle,
            command: InterfaceCommand::Invalid,
            dsj: DSJ_POWER_ON,
            count: 0,
            data: Vec::new(),
            end_of_data: false,
            loopback: [0; LOOPBACK_BYTES],
            self_test: 0,
        }
    }

    fn name(&self) -> String {
        format!("DA unit {}", self.number)
    }

    fn is_disc_transfer(&self) -> bool {
        matches!(
            self.command,
            InterfaceCommand::DiscCommand
                | InterfaceCommand::ReadData
                | InterfaceCommand::WriteData
                | InterfaceCommand::SendStatus
        )
    }

    /// Whether sourced bytes come from the controller's sector
    /// buffer rather than the unit's own data.
    fn sources_controller(&self) -> bool {
        self.state != InterfaceState::ErrorSource && self.is_disc_transfer()
    }

    fn source_length(&self) -> usize {
        if self.sources_controller() {
            self.controller.byte_length()
        } else {
            self.data.len()
        }
    }

    fn source_byte(&self, index: usize) -> u8 {
        if self.sources_controller() {
            self.controller.unload_byte(index).unwrap_or(0)
        } else {
            self.data.get(index).copied().unwrap_or(0)
        }
    }
}

/// Status of one unit, for display.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: usize,
    pub configuration: DiscConfiguration,
    pub image: Option<String>,
    pub heads_loaded: bool,
    pub state: InterfaceState,
    pub command: InterfaceCommand,
    pub dsj: u8,
    pub status: StatusCode,
    pub cylinder: u16,
    pub head: u8,
    pub sector: u8,
}

/// The drives on one interface's bus.
#[derive(Debug)]
pub struct AmigoDisc {
    units: Vec<DaUnit>,
    events: EventQueue<usize>,
}

impl Default for AmigoDisc {
    fn default() -> Self {
        Self::new()
    }
}

impl AmigoDisc {
    pub fn new() -> AmigoDisc {
        AmigoDisc {
            units: DEFAULT_ADDRESSES
                .iter()
                .enumerate()
                .map(|(n, address)| DaUnit::new(n, *address))
                .collect(),
            events: EventQueue::new(),
        }
    }

    pub fn next_event_due(&self) -> Option<Duration> {
        self.events.next_due()
    }

    fn unit_at(&self, address: BusAddress) -> Option<usize> {
        self.units
            .iter()
            .position(|u| u.address == address && u.drive.is_attached())
    }

    fn get_unit(&self, unit: usize) -> Result<&DaUnit, ConfigurationError> {
        self.units.get(unit).ok_or(ConfigurationError::NoSuchUnit(unit))
    }

    fn get_unit_mut(&mut self, unit: usize) -> Result<&mut DaUnit, ConfigurationError> {
        self.units
            .get_mut(unit)
            .ok_or(ConfigurationError::NoSuchUnit(unit))
    }

    fn schedule(&mut self, unit: usize, ctx: &Context, delay: Duration) {
        self.events.activate(unit, ctx.after(delay.max(DATA_TIME)));
    }

    fn set_state(&mut self, unit: usize, state: InterfaceState) {
        let u = &mut self.units[unit];
        if u.state != state {
            event!(
                Level::DEBUG,
                "{}: {} -> {} ({})",
                u.name(),
                u.state,
                state,
                u.command
            );
            u.state = state;
        }
    }

    /// Starts interface command `command` in `state`, abandoning
    /// whatever the unit was doing.
    fn begin(
        &mut self,
        ctx: &Context,
        unit: usize,
        command: InterfaceCommand,
        state: InterfaceState,
    ) {
        self.events.cancel(unit);
        let u = &mut self.units[unit];
        u.command = command;
        u.count = 0;
        u.end_of_data = false;
        u.data.clear();
        self.set_state(unit, state);
        if matches!(
            state,
            InterfaceState::CommandExec | InterfaceState::ReadXfer | InterfaceState::WriteXfer
        ) {
            self.schedule(unit, ctx, DATA_TIME);
        }
    }

    fn hold_off(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
        hold: bool,
    ) -> Result<(), Stop> {
        let originator = Originator::Device(self.units[unit].address);
        if hold {
            card.bus_control(self, ctx, originator, BusLines::NRFD, BusLines::empty())
        } else {
            card.bus_control(self, ctx, originator, BusLines::empty(), BusLines::NRFD)
        }
    }

    /// Returns the unit to idle and enables its parallel poll
    /// response.
    fn finish_idle(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        self.events.cancel(unit);
        let u = &mut self.units[unit];
        u.controller.idle_controller();
        u.command = InterfaceCommand::Invalid;
        u.count = 0;
        u.end_of_data = false;
        u.data.clear();
        let address = u.address;
        self.set_state(unit, InterfaceState::Idle);
        card.poll_response(address, true);
        self.hold_off(card, ctx, unit, false)
    }

    fn error_source(&mut self, ctx: &Context, unit: usize) {
        let command = self.units[unit].command;
        self.begin(ctx, unit, command, InterfaceState::ErrorSource);
        self.units[unit].data = vec![0];
        self.schedule(unit, ctx, DATA_TIME);
    }

    fn error_sink(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        let command = self.units[unit].command;
        self.begin(ctx, unit, command, InterfaceState::ErrorSink);
        self.hold_off(card, ctx, unit, false)
    }

    /// Reports an I/O program error.  An idle unit stays idle.  Once
    /// a disc opcode has been accepted, the class of the abandoned
    /// command decides whether the unit sources an error byte or
    /// sinks data; before that, the direction it is addressed in does.
    fn protocol_error(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
        talker: bool,
    ) -> Result<(), Stop> {
        use InterfaceState::*;
        self.events.cancel(unit);
        let u = &mut self.units[unit];
        event!(
            Level::WARN,
            "{}: I/O program error in state {} ({})",
            u.name(),
            u.state,
            u.command
        );
        let class = match u.state {
            ReadWait | WriteWait | StatusWait => Some(u.controller.classify()),
            CommandExec | CommandWait | ReadXfer | WriteXfer if u.is_disc_transfer() => {
                Some(u.controller.classify())
            }
            _ => None,
        };
        u.controller.idle_controller();
        u.controller.end_command(StatusCode::IoProgramError);
        u.dsj = DSJ_ERROR;
        match (u.state, class) {
            (Idle, _) => Ok(()),
            (_, Some(OpcodeClass::Read | OpcodeClass::Status)) => {
                self.error_source(ctx, unit);
                Ok(())
            }
            (_, Some(OpcodeClass::Write)) => self.error_sink(card, ctx, unit),
            (_, Some(OpcodeClass::Control)) => self.finish_idle(card, ctx, unit),
            (_, None) if talker => {
                self.error_source(ctx, unit);
                Ok(())
            }
            (_, None) => self.error_sink(card, ctx, unit),
        }
    }

    /// Finishes a disc command with `status`.
    fn complete(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
        status: StatusCode,
    ) -> Result<(), Stop> {
        let u = &mut self.units[unit];
        let opcode = u
            .controller
            .opcode()
            .map_or_else(|| "command".to_string(), |op| op.to_string());
        if status.is_success() {
            event!(Level::INFO, "{}: {} completed: {}", u.name(), opcode, status);
            u.dsj = DSJ_NORMAL;
            return self.finish_idle(card, ctx, unit);
        }
        event!(Level::INFO, "{}: {} failed: {}", u.name(), opcode, status);
        u.dsj = DSJ_ERROR;
        match u.controller.classify() {
            OpcodeClass::Read | OpcodeClass::Status => {
                self.error_source(ctx, unit);
                Ok(())
            }
            OpcodeClass::Write => self.error_sink(card, ctx, unit),
            OpcodeClass::Control => self.finish_idle(card, ctx, unit),
        }
    }

    /// Clears a unit as Amigo Clear, SDC and DCL do.
    fn device_clear(&mut self, ctx: &Context, unit: usize) {
        self.units[unit].controller.idle_controller();
        self.begin(ctx, unit, InterfaceCommand::AmigoClear, InterfaceState::CommandExec);
    }

    fn accept_command(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
        byte: u8,
    ) -> Result<bool, Stop> {
        let address = self.units[unit].address;
        let command = BusCommand::from(byte);
        event!(
            Level::TRACE,
            "{}: accepts {}",
            self.units[unit].name(),
            command
        );
        match command {
            BusCommand::Listen(a) => {
                if a == u8::from(address) {
                    card.listen(address);
                }
            }
            BusCommand::Unlisten => {
                card.unlisten(address);
                self.unlistened(card, ctx, unit)?;
            }
            BusCommand::Talk(a) => {
                if a == u8::from(address) {
                    card.talk(address);
                } else {
                    // Addressing another talker unaddresses this one.
                    card.untalk(address);
                    self.untalked(card, ctx, unit)?;
                }
            }
            BusCommand::Untalk => {
                card.untalk(address);
                self.untalked(card, ctx, unit)?;
            }
            BusCommand::Secondary(secondary) => {
                return self.accept_secondary(card, ctx, unit, secondary);
            }
            BusCommand::Addressed(SDC) | BusCommand::Universal(DCL) => {
                self.device_clear(ctx, unit);
            }
            BusCommand::Addressed(_) | BusCommand::Universal(_) => (),
        }
        Ok(true)
    }

    fn accept_secondary(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
        secondary: u8,
    ) -> Result<bool, Stop> {
        use InterfaceCommand::*;
        use InterfaceState::*;

        let address = self.units[unit].address;
        let listening = card.bus().is_listener(address);
        let talking = card.bus().is_talker(address);
        if !listening && !talking {
            let bus = card.bus();
            if bus.listeners == 0 && bus.talker == 0 && secondary == u8::from(address) {
                card.talk(address);
                self.begin(ctx, unit, AmigoIdentify, CommandExec);
                return Ok(true);
            }
            // Meant for some other device.
            return Ok(false);
        }

        let state = self.units[unit].state;
        let command = InterfaceCommand::decode(secondary, listening);
        match command {
            DiscCommand
                if matches!(
                    state,
                    Idle | OpcodeWait
                        | ParameterWait
                        | ReadWait
                        | WriteWait
                        | StatusWait
                        | ErrorSink
                ) =>
            {
                if state != Idle {
                    event!(
                        Level::DEBUG,
                        "{}: new disc command abandons the one in {}",
                        self.units[unit].name(),
                        state
                    );
                }
                self.units[unit].controller.idle_controller();
                card.poll_response(address, false);
                self.begin(ctx, unit, DiscCommand, OpcodeWait);
                self.hold_off(card, ctx, unit, false)?;
            }
            AmigoClear => self.device_clear(ctx, unit),
            WriteData if state == WriteWait => {
                // Hold off the host until the sector buffer is ready.
                self.begin(ctx, unit, WriteData, WriteXfer);
                self.hold_off(card, ctx, unit, true)?;
            }
            ReadData if state == ReadWait => self.begin(ctx, unit, ReadData, ReadXfer),
            SendStatus if state == StatusWait => self.begin(ctx, unit, SendStatus, CommandExec),
            CrcListen | WriteLoopback | InitiateSelfTest | CrcTalk | Dsj | ReadLoopback
            | ReturnSelfTestResult
                if state == Idle =>
            {
                self.begin(ctx, unit, command, CommandExec);
            }
            _ => self.protocol_error(card, ctx, unit, talking)?,
        }
        Ok(true)
    }

    fn accept_data(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
        byte: u8,
    ) -> Result<bool, Stop> {
        let eoi = card.lines().contains(BusLines::EOI);
        let u = &mut self.units[unit];
        event!(
            Level::TRACE,
            "{}: accepts data {:03o}{} in state {}",
            u.name(),
            byte,
            if eoi { " with EOI" } else { "" },
            u.state
        );
        match u.state {
            InterfaceState::OpcodeWait => {
                if u.controller.prepare_command(byte) {
                    u.count = 1;
                    if eoi {
                        self.parameter_error(card, ctx, unit, false)?;
                    } else {
                        self.set_state(unit, InterfaceState::ParameterWait);
                    }
                } else {
                    u.dsj = DSJ_ERROR;
                    if eoi {
                        self.finish_idle(card, ctx, unit)?;
                    } else {
                        self.error_sink(card, ctx, unit)?;
                    }
                }
            }
            InterfaceState::ParameterWait => {
                u.controller.load_byte(u.count, byte);
                u.count += 1;
                let expected = u.controller.parameter_bytes();
                if u.count < expected {
                    if eoi {
                        self.parameter_error(card, ctx, unit, false)?;
                    }
                } else if !eoi {
                    self.parameter_error(card, ctx, unit, true)?;
                } else {
                    self.parameters_complete(ctx, unit);
                }
            }
            InterfaceState::WriteXfer => self.receive(card, ctx, unit, byte, eoi)?,
            InterfaceState::ErrorSink => {
                if eoi {
                    self.finish_idle(card, ctx, unit)?;
                }
            }
            InterfaceState::CommandExec if u.command == InterfaceCommand::AmigoClear => (),
            state => {
                event!(
                    Level::WARN,
                    "{}: data byte {:03o} ignored in state {}",
                    u.name(),
                    byte,
                    state
                );
            }
        }
        Ok(true)
    }

    /// The wrong number of parameter bytes arrived.
    fn parameter_error(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
        more_coming: bool,
    ) -> Result<(), Stop> {
        let u = &mut self.units[unit];
        event!(
            Level::WARN,
            "{}: wrong parameter count for {}",
            u.name(),
            u.controller
                .opcode()
                .map_or_else(|| "command".to_string(), |op| op.to_string())
        );
        u.controller.end_command(StatusCode::IoProgramError);
        u.dsj = DSJ_ERROR;
        if more_coming {
            self.error_sink(card, ctx, unit)
        } else {
            self.finish_idle(card, ctx, unit)
        }
    }

    fn parameters_complete(&mut self, ctx: &Context, unit: usize) {
        let next = match self.units[unit].controller.classify() {
            OpcodeClass::Read => InterfaceState::ReadWait,
            OpcodeClass::Write => InterfaceState::WriteWait,
            OpcodeClass::Status => InterfaceState::StatusWait,
            OpcodeClass::Control => {
                self.begin(ctx, unit, InterfaceCommand::DiscCommand, InterfaceState::CommandExec);
                return;
            }
        };
        self.set_state(unit, next);
    }

    /// Handles a byte of write data.
    fn receive(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
        byte: u8,
        eoi: bool,
    ) -> Result<(), Stop> {
        let u = &mut self.units[unit];
        match u.command {
            InterfaceCommand::WriteData => {
                if u.end_of_data || u.controller.phase() != Phase::Data {
                    event!(
                        Level::WARN,
                        "{}: write byte {:03o} arrived while the buffer was not ready",
                        u.name(),
                        byte
                    );
                    return Ok(());
                }
                u.controller.load_byte(u.count, byte);
                u.count += 1;
                if eoi || u.count >= u.controller.byte_length() {
                    self.end_of_write(card, ctx, unit)?;
                }
                Ok(())
            }
            InterfaceCommand::WriteLoopback => {
                if let Some(slot) = u.loopback.get_mut(u.count) {
                    *slot = byte;
                }
                u.count += 1;
                if eoi || u.count >= LOOPBACK_BYTES {
                    self.finish_idle(card, ctx, unit)?;
                }
                Ok(())
            }
            InterfaceCommand::InitiateSelfTest => {
                // Every test passes.
                u.self_test = 0;
                self.finish_idle(card, ctx, unit)
            }
            InterfaceCommand::CrcListen => {
                if eoi {
                    self.finish_idle(card, ctx, unit)?;
                }
                Ok(())
            }
            command => Err(Stop::internal(
                u.name(),
                format!("write data received for {command}"),
            )),
        }
    }

    /// The host has sent the last byte of a sector (or stopped early);
    /// hold the bus off while the sector is written.
    fn end_of_write(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        self.units[unit].end_of_data = true;
        self.schedule(unit, ctx, DATA_TIME);
        self.hold_off(card, ctx, unit, true)
    }

    /// The unit has stopped being a listener.
    fn unlistened(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        let u = &self.units[unit];
        match u.state {
            InterfaceState::OpcodeWait | InterfaceState::ParameterWait => {
                self.parameter_error(card, ctx, unit, false)
            }
            InterfaceState::WriteXfer => {
                if u.command != InterfaceCommand::WriteData {
                    self.finish_idle(card, ctx, unit)
                } else if u.count == 0 {
                    event!(
                        Level::DEBUG,
                        "{}: write abandoned before any data arrived",
                        u.name()
                    );
                    self.finish_idle(card, ctx, unit)
                } else if !u.end_of_data {
                    event!(
                        Level::DEBUG,
                        "{}: unlisten ends the write after {} bytes",
                        u.name(),
                        u.count
                    );
                    self.end_of_write(card, ctx, unit)
                } else {
                    Ok(())
                }
            }
            InterfaceState::ErrorSink => self.finish_idle(card, ctx, unit),
            _ => Ok(()),
        }
    }

    /// The unit has stopped being the talker.
    fn untalked(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        let u = &mut self.units[unit];
        match u.state {
            InterfaceState::ReadXfer
                if u.is_disc_transfer() && u.controller.phase() == Phase::Data =>
            {
                if !u.end_of_data {
                    event!(
                        Level::DEBUG,
                        "{}: untalk ends the read after {} bytes",
                        u.name(),
                        u.count
                    );
                    u.end_of_data = true;
                    if !self.events.is_pending(unit) {
                        self.schedule(unit, ctx, DATA_TIME);
                    }
                }
                Ok(())
            }
            InterfaceState::ReadXfer | InterfaceState::ErrorSource => {
                self.finish_idle(card, ctx, unit)
            }
            InterfaceState::CommandExec | InterfaceState::CommandWait
                if u.command.sources_data() =>
            {
                event!(
                    Level::DEBUG,
                    "{}: untalk abandons {} before any data was sent",
                    u.name(),
                    u.command
                );
                self.finish_idle(card, ctx, unit)
            }
            _ => Ok(()),
        }
    }

    /// IFC: end any transfer as if the unit had been unaddressed,
    /// and abandon any command other than a device clear.
    fn interface_clear(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
    ) -> Result<(), Stop> {
        use InterfaceState::*;
        match self.units[unit].state {
            ReadXfer | ErrorSource => self.untalked(card, ctx, unit),
            WriteXfer | ErrorSink => self.unlistened(card, ctx, unit),
            OpcodeWait | ParameterWait | ReadWait | WriteWait | StatusWait => {
                self.finish_idle(card, ctx, unit)
            }
            CommandExec | CommandWait
                if self.units[unit].command == InterfaceCommand::AmigoClear =>
            {
                Ok(())
            }
            CommandExec | CommandWait => {
                event!(
                    Level::DEBUG,
                    "{}: interface clear abandons {}",
                    self.units[unit].name(),
                    self.units[unit].command
                );
                self.finish_idle(card, ctx, unit)
            }
            Idle => Ok(()),
        }
    }

    /// Performs the unit activity which is due.
    pub fn service(&mut self, card: &mut DiCard, ctx: &Context) -> Result<(), Stop> {
        while let Some(unit) = self.events.pop_due(ctx.simulated_time) {
            let span = span!(Level::ERROR, "DA", unit);
            let _enter = span.enter();
            self.service_unit(card, ctx, unit)?;
        }
        Ok(())
    }

    fn service_unit(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        let u = &self.units[unit];
        match u.state {
            InterfaceState::CommandExec => self.execute(card, ctx, unit),
            InterfaceState::CommandWait => self.command_wait(card, ctx, unit),
            InterfaceState::ReadXfer => self.read_transfer(card, ctx, unit),
            InterfaceState::WriteXfer => self.write_transfer(card, ctx, unit),
            InterfaceState::ErrorSource => self.pump(card, ctx, unit),
            state => {
                let stop = Stop::internal(u.name(), format!("service entered in state {state}"));
                event!(Level::ERROR, "{}", stop);
                Err(stop)
            }
        }
    }

    fn execute(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        use InterfaceCommand::*;
        let u = &mut self.units[unit];
        match u.command {
            DiscCommand | SendStatus => match u.controller.start_command(&u.drive) {
                None => {
                    let status = u.controller.status();
                    self.complete(card, ctx, unit, status)
                }
                Some(_) => {
                    let wait = u.controller.wait();
                    self.set_state(unit, InterfaceState::CommandWait);
                    self.schedule(unit, ctx, wait);
                    Ok(())
                }
            },
            AmigoIdentify => {
                let data = vec![0x00, u.drive.model.identify_byte()];
                self.start_source(card, ctx, unit, data)
            }
            Dsj => {
                let data = vec![u.dsj];
                self.start_source(card, ctx, unit, data)
            }
            ReadLoopback => {
                let data = u.loopback.to_vec();
                self.start_source(card, ctx, unit, data)
            }
            ReturnSelfTestResult => {
                let data = vec![u.self_test];
                self.start_source(card, ctx, unit, data)
            }
            CrcTalk => self.start_source(card, ctx, unit, vec![0, 0]),
            AmigoClear => {
                u.controller.clear_controller(&mut u.drive, ClearKind::Device);
                u.dsj = DSJ_NORMAL;
                event!(Level::INFO, "{}: cleared", u.name());
                self.finish_idle(card, ctx, unit)
            }
            WriteLoopback | InitiateSelfTest | CrcListen => {
                u.count = 0;
                self.set_state(unit, InterfaceState::WriteXfer);
                self.hold_off(card, ctx, unit, false)
            }
            command @ (ReadData | WriteData | Invalid) => Err(Stop::internal(
                u.name(),
                format!("{command} command executed"),
            )),
        }
    }

    fn command_wait(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        let u = &mut self.units[unit];
        let name = u.name();
        let status = u.controller.service_drive(&mut u.drive, &name)?;
        match (u.controller.state(), u.controller.phase()) {
            (ControllerState::Idle, _) => self.complete(card, ctx, unit, status),
            (ControllerState::Busy, Phase::Data) => {
                u.count = 0;
                self.set_state(unit, InterfaceState::ReadXfer);
                self.pump(card, ctx, unit)
            }
            (ControllerState::Busy, _) => {
                let wait = u.controller.wait();
                self.schedule(unit, ctx, wait);
                Ok(())
            }
        }
    }

    fn read_transfer(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        let u = &mut self.units[unit];
        if !u.is_disc_transfer() {
            return self.pump(card, ctx, unit);
        }
        let name = u.name();
        match (u.controller.state(), u.controller.phase()) {
            (ControllerState::Idle, _) => match u.controller.start_command(&u.drive) {
                None => {
                    let status = u.controller.status();
                    self.complete(card, ctx, unit, status)
                }
                Some(_) => {
                    let wait = u.controller.wait();
                    self.schedule(unit, ctx, wait);
                    Ok(())
                }
            },
            (ControllerState::Busy, Phase::Start) => {
                let status = u.controller.service_drive(&mut u.drive, &name)?;
                if u.controller.state() == ControllerState::Idle {
                    return self.complete(card, ctx, unit, status);
                }
                // The sector is in the buffer once the drive has read it.
                u.count = 0;
                let wait = u.controller.wait();
                self.schedule(unit, ctx, wait);
                Ok(())
            }
            (ControllerState::Busy, Phase::Data) => {
                if u.end_of_data {
                    self.end_disc_transfer(card, ctx, unit)
                } else {
                    self.pump(card, ctx, unit)
                }
            }
            (ControllerState::Busy, Phase::End) => Err(Stop::internal(
                name,
                "read transfer serviced while the heads are moving",
            )),
        }
    }

    fn write_transfer(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
    ) -> Result<(), Stop> {
        let u = &mut self.units[unit];
        let name = u.name();
        if !u.is_disc_transfer() {
            return Err(Stop::internal(
                name,
                format!("{} write transfer serviced", u.command),
            ));
        }
        match (u.controller.state(), u.controller.phase()) {
            (ControllerState::Idle, _) => match u.controller.start_command(&u.drive) {
                None => {
                    let status = u.controller.status();
                    self.complete(card, ctx, unit, status)
                }
                Some(_) => {
                    let wait = u.controller.wait();
                    self.schedule(unit, ctx, wait);
                    Ok(())
                }
            },
            (ControllerState::Busy, Phase::Start) => {
                let status = u.controller.service_drive(&mut u.drive, &name)?;
                if u.controller.state() == ControllerState::Idle {
                    self.complete(card, ctx, unit, status)
                } else {
                    // Ready for the data.
                    self.hold_off(card, ctx, unit, false)
                }
            }
            (ControllerState::Busy, Phase::Data) if u.end_of_data => {
                self.end_disc_transfer(card, ctx, unit)
            }
            (state, phase) => Err(Stop::internal(
                name,
                format!("write transfer serviced with the controller {state:?} in phase {phase:?}"),
            )),
        }
    }

    fn end_disc_transfer(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
    ) -> Result<(), Stop> {
        let u = &mut self.units[unit];
        let name = u.name();
        let status = u.controller.service_drive(&mut u.drive, &name)?;
        self.complete(card, ctx, unit, status)
    }

    fn start_source(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        unit: usize,
        data: Vec<u8>,
    ) -> Result<(), Stop> {
        let u = &mut self.units[unit];
        u.data = data;
        u.count = 0;
        self.set_state(unit, InterfaceState::ReadXfer);
        self.pump(card, ctx, unit)
    }

    /// Sends bytes to the bus for as long as it is ready for them.
    /// The last byte carries EOI.
    fn pump(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        loop {
            let u = &self.units[unit];
            let address = u.address;
            let total = u.source_length();
            if u.count >= total {
                return self.end_source(card, ctx, unit);
            }
            if card.lines().intersects(BusLines::ATN | BusLines::NRFD)
                || !card.bus().is_talker(address)
            {
                // A bus change will call respond() when it is ready.
                return Ok(());
            }
            let byte = u.source_byte(u.count);
            let last = u.count + 1 == total;
            self.units[unit].count += 1;
            let originator = Originator::Device(address);
            if last {
                card.bus_control(self, ctx, originator, BusLines::EOI, BusLines::empty())?;
            }
            card.bus_source(self, ctx, originator, byte)?;
        }
    }

    fn end_source(&mut self, card: &mut DiCard, ctx: &Context, unit: usize) -> Result<(), Stop> {
        let originator = Originator::Device(self.units[unit].address);
        card.bus_control(self, ctx, originator, BusLines::empty(), BusLines::EOI)?;
        let u = &mut self.units[unit];
        if u.state == InterfaceState::ErrorSource {
            return self.finish_idle(card, ctx, unit);
        }
        if u.is_disc_transfer() {
            return self.end_disc_transfer(card, ctx, unit);
        }
        if u.command == InterfaceCommand::Dsj && u.dsj == DSJ_POWER_ON {
            u.dsj = DSJ_NORMAL;
        }
        self.finish_idle(card, ctx, unit)
    }

    pub fn power_on(&mut self, card: &mut DiCard) {
        self.events.clear();
        for u in self.units.iter_mut() {
            u.controller.clear_controller(&mut u.drive, ClearKind::PowerOn);
            u.state = InterfaceState::Idle;
            u.command = InterfaceCommand::Invalid;
            u.dsj = DSJ_POWER_ON;
            u.count = 0;
            u.end_of_data = false;
            u.data.clear();
            if u.drive.is_attached() {
                card.poll_response(u.address, true);
            }
        }
    }

    /// Unloads the heads of a unit.  A unit with nothing else to do
    /// reports drive attention, as the drive does when its heads are
    /// unloaded by hand.
    pub fn unload(&mut self, card: &mut DiCard, unit: usize) -> Result<(), ConfigurationError> {
        let u = self.get_unit_mut(unit)?;
        if !u.drive.is_attached() {
            return Err(ConfigurationError::NotAttached(unit));
        }
        u.drive.unload_heads();
        if u.state == InterfaceState::Idle && u.controller.state() == ControllerState::Idle {
            event!(Level::INFO, "{}: heads unloaded; drive attention", u.name());
            u.controller.end_command(StatusCode::DriveAttention);
            u.dsj = DSJ_ERROR;
            card.poll_response(u.address, true);
        }
        Ok(())
    }

    pub fn load(&mut self, card: &mut DiCard, unit: usize) -> Result<(), ConfigurationError> {
        let u = self.get_unit_mut(unit)?;
        if !u.drive.load_heads() {
            return Err(ConfigurationError::NotAttached(unit));
        }
        if u.state == InterfaceState::Idle {
            card.poll_response(u.address, true);
        }
        Ok(())
    }

    fn report(&self, unit: usize) -> Option<UnitReport> {
        let u = self.units.get(unit)?;
        let (cylinder, head, sector) = u.controller.address();
        Some(UnitReport {
            unit,
            configuration: DiscConfiguration {
                address: u.address,
                model: u.drive.model,
                protect: u.drive.protect,
                format: u.drive.format,
            },
            image: u.drive.image_name().map(str::to_string),
            heads_loaded: u.drive.heads_loaded(),
            state: u.state,
            command: u.command,
            dsj: u.dsj,
            status: u.controller.status(),
            cylinder,
            head,
            sector,
        })
    }
}

impl BusParticipant for AmigoDisc {
    fn accept(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        address: BusAddress,
        byte: u8,
    ) -> Result<bool, Stop> {
        let Some(unit) = self.unit_at(address) else {
            return Ok(false);
        };
        if card.lines().contains(BusLines::ATN) {
            self.accept_command(card, ctx, unit, byte)
        } else {
            self.accept_data(card, ctx, unit, byte)
        }
    }

    fn respond(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        address: BusAddress,
        lines: BusLines,
    ) -> Result<(), Stop> {
        let Some(unit) = self.unit_at(address) else {
            return Ok(());
        };
        if lines.contains(BusLines::IFC) {
            return self.interface_clear(card, ctx, unit);
        }
        let sourcing = matches!(
            self.units[unit].state,
            InterfaceState::ReadXfer | InterfaceState::ErrorSource
        );
        if sourcing
            && !lines.intersects(BusLines::ATN | BusLines::NRFD)
            && card.bus().is_talker(address)
            && !self.events.is_pending(unit)
        {
            self.schedule(unit, ctx, DATA_TIME);
        }
        Ok(())
    }
}

/// Status of a disc interface, for display.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceReport {
    pub configuration: CardConfiguration,
    pub card: CardReport,
    pub units: Vec<UnitReport>,
}

/// A 12821A card with Amigo drives on its bus.
#[derive(Debug)]
pub struct DiscInterface {
    card: DiCard,
    disc: AmigoDisc,
}

impl DiscInterface {
    pub fn new(config: CardConfiguration) -> DiscInterface {
        DiscInterface {
            card: DiCard::new(config),
            disc: AmigoDisc::new(),
        }
    }

    pub fn card(&self) -> &DiCard {
        &self.card
    }

    pub fn unit_state(&self, unit: usize) -> Option<InterfaceState> {
        self.disc.units.get(unit).map(|u| u.state)
    }

    pub fn dsj(&self, unit: usize) -> Option<u8> {
        self.disc.units.get(unit).map(|u| u.dsj)
    }

    pub fn configuration(&self, unit: usize) -> Option<DiscConfiguration> {
        self.disc.report(unit).map(|report| report.configuration)
    }

    pub fn report(&self) -> InterfaceReport {
        InterfaceReport {
            configuration: self.card.config().clone(),
            card: self.card.report(),
            units: (0..UNITS).filter_map(|unit| self.disc.report(unit)).collect(),
        }
    }

    /// Applies switch settings to a unit.  The model of an attached
    /// unit cannot be changed.
    pub fn configure(
        &mut self,
        unit: usize,
        config: &DiscConfiguration,
    ) -> Result<(), ConfigurationError> {
        let current = self.disc.get_unit(unit)?;
        if current.drive.is_attached() && current.drive.model != config.model {
            return Err(ConfigurationError::AlreadyAttached(unit));
        }
        self.set_address(unit, config.address)?;
        let u = self.disc.get_unit_mut(unit)?;
        u.drive.model = config.model;
        u.drive.protect = config.protect;
        u.drive.format = config.format;
        Ok(())
    }

    pub fn set_address(
        &mut self,
        unit: usize,
        address: BusAddress,
    ) -> Result<(), ConfigurationError> {
        let old = self.disc.get_unit(unit)?.address;
        if let Some(other) = self
            .disc
            .units
            .iter()
            .position(|u| u.number != unit && u.address == address)
        {
            return Err(ConfigurationError::DuplicateAddress {
                unit: other,
                address,
            });
        }
        if old == address {
            return Ok(());
        }
        let u = self.disc.get_unit_mut(unit)?;
        u.address = address;
        if u.drive.is_attached() {
            let respond = self.card.bus().poll_response & old.bit() != 0;
            self.card.detach_device(old);
            self.card.attach_device(address);
            self.card.poll_response(address, respond);
        }
        event!(
            Level::INFO,
            "DA unit {} moved from bus address {} to {}",
            unit,
            old,
            address
        );
        Ok(())
    }

    pub fn set_model(&mut self, unit: usize, model: DriveModel) -> Result<(), ConfigurationError> {
        let u = self.disc.get_unit_mut(unit)?;
        if u.drive.is_attached() {
            return Err(ConfigurationError::AlreadyAttached(unit));
        }
        u.drive.model = model;
        Ok(())
    }

    pub fn set_protect(&mut self, unit: usize, protect: bool) -> Result<(), ConfigurationError> {
        self.disc.get_unit_mut(unit)?.drive.protect = protect;
        Ok(())
    }

    pub fn set_format(&mut self, unit: usize, format: bool) -> Result<(), ConfigurationError> {
        self.disc.get_unit_mut(unit)?.drive.format = format;
        Ok(())
    }

    /// Mounts a disc image on a unit and puts the unit on the bus.
    pub fn attach(&mut self, unit: usize, image: DiscImage) -> Result<(), ConfigurationError> {
        let u = self.disc.get_unit_mut(unit)?;
        if u.drive.is_attached() {
            return Err(ConfigurationError::AlreadyAttached(unit));
        }
        event!(
            Level::INFO,
            "{}: {} attached to {} at bus address {}",
            u.name(),
            u.drive.model,
            image.name(),
            u.address
        );
        u.drive.attach(image);
        let address = u.address;
        self.card.attach_device(address);
        self.card.poll_response(address, true);
        Ok(())
    }

    /// Removes the image from a unit and takes the unit off the bus.
    pub fn detach(&mut self, unit: usize) -> Result<DiscImage, ConfigurationError> {
        let u = self.disc.get_unit_mut(unit)?;
        let Some(image) = u.drive.detach() else {
            return Err(ConfigurationError::NotAttached(unit));
        };
        event!(Level::INFO, "{}: {} detached", u.name(), image.name());
        u.controller.idle_controller();
        u.state = InterfaceState::Idle;
        u.command = InterfaceCommand::Invalid;
        let address = u.address;
        self.disc.events.cancel(unit);
        self.card.detach_device(address);
        Ok(image)
    }

    pub fn load(&mut self, unit: usize) -> Result<(), ConfigurationError> {
        self.disc.load(&mut self.card, unit)
    }

    pub fn unload(&mut self, unit: usize) -> Result<(), ConfigurationError> {
        self.disc.unload(&mut self.card, unit)
    }
}

impl IoCard for DiscInterface {
    fn name(&self) -> String {
        self.card.name().to_string()
    }

    fn io(
        &mut self,
        ctx: &Context,
        inbound: InboundSignals,
        data: u16,
    ) -> Result<SignalsValue, Stop> {
        let result = self.card.io(&mut self.disc, ctx, inbound, data)?;
        if inbound.contains(InboundSignals::PON) {
            self.disc.power_on(&mut self.card);
        }
        Ok(result)
    }

    fn service(&mut self, ctx: &Context) -> Result<(), Stop> {
        if self
            .card
            .ifc_deadline()
            .is_some_and(|deadline| deadline <= ctx.simulated_time)
        {
            self.card.service(&mut self.disc, ctx)?;
        }
        self.disc.service(&mut self.card, ctx)
    }

    fn next_event_due(&self) -> Option<Duration> {
        match (self.disc.next_event_due(), self.card.ifc_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
