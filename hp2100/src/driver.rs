//! A host-side driver for an Amigo drive.  It programs a disc
//! interface card through the backplane the way an HP 2100 program
//! would, using I/O instructions and the card's unpacked mode (one
//! bus byte per word, with ATN and EOI in bits 8 and 9).
//!
//! Waiting never blocks: when the driver needs the card or a drive to
//! do something, it advances the simulated clock to the next
//! scheduled event.
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use tracing::{event, Level};

use base::prelude::*;

use crate::clock::{BasicClock, Clock};
use crate::context::Context;
use crate::da::{DiscInterface, InterfaceReport};
use crate::di::{ControlWord, StatusWord};
use crate::disclib::{Opcode, StatusCode, SECTOR_WORDS};
use crate::hpib::{LISTEN_BASE, SECONDARY_BASE, TALK_BASE, UNL, UNT};
use crate::io::Backplane;
use crate::stop::Stop;

/// The simulated time one I/O instruction takes.
pub const INSTRUCTION_TIME: Duration = Duration::from_micros(2);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const WORD_ATN: u16 = 0o400;
const WORD_EOI: u16 = 0o1000;

const SECONDARY_DATA: u8 = 0x00;
const SECONDARY_COMMAND: u8 = 0x08;
const SECONDARY_DSJ: u8 = 0x10;

#[derive(Debug)]
pub enum DriverError {
    Stop(Stop),
    Timeout { waiting_for: &'static str },
    /// The drive finished the command with a non-zero DSJ.  `status`
    /// holds the two Request Status words.
    UnitError { dsj: u8, status: [u16; 2] },
    NoCard(SelectCode),
    /// A write was asked to send no data.
    NothingToWrite,
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Stop(stop) => write!(f, "simulation stopped: {stop}"),
            DriverError::Timeout { waiting_for } => {
                write!(f, "timed out waiting for {waiting_for}")
            }
            DriverError::UnitError { dsj, status } => {
                write!(f, "drive returned DSJ {dsj}")?;
                match StatusCode::try_from((status[0] >> 8) as u8) {
                    Ok(code) => write!(f, " with status {code}")?,
                    Err(n) => write!(f, " with unknown status {n:o}")?,
                }
                write!(f, " (status words {:06o} {:06o})", status[0], status[1])
            }
            DriverError::NoCard(sc) => write!(f, "there is no disc interface at select code {sc}"),
            DriverError::NothingToWrite => f.write_str("a sector write needs at least one word"),
        }
    }
}

impl Error for DriverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DriverError::Stop(stop) => Some(stop),
            _ => None,
        }
    }
}

impl From<Stop> for DriverError {
    fn from(stop: Stop) -> DriverError {
        DriverError::Stop(stop)
    }
}

fn command_word(byte: u8) -> u16 {
    WORD_ATN | u16::from(byte)
}

/// Data bytes as unpacked words, the last one marked with EOI.
fn data_words(bytes: &[u8]) -> Vec<u16> {
    let mut words: Vec<u16> = bytes.iter().map(|b| u16::from(*b)).collect();
    if let Some(last) = words.last_mut() {
        *last |= WORD_EOI;
    }
    words
}

pub struct HostDriver {
    backplane: Backplane,
    clock: BasicClock,
    started: Instant,
    select_code: SelectCode,
    address: BusAddress,
    timeout: Duration,
}

impl HostDriver {
    /// Plugs `interface` into an otherwise empty backplane at
    /// `select_code`.  The driver talks to the drive at `address`.
    pub fn new(
        select_code: SelectCode,
        interface: DiscInterface,
        address: BusAddress,
    ) -> HostDriver {
        let mut backplane = Backplane::new();
        backplane.attach(select_code, Box::new(interface));
        HostDriver {
            backplane,
            clock: BasicClock::new(),
            started: Instant::now(),
            select_code,
            address,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> HostDriver {
        self.timeout = timeout;
        self
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn interface(&self) -> Result<&DiscInterface, DriverError> {
        self.backplane
            .card_as::<DiscInterface>(self.select_code)
            .ok_or(DriverError::NoCard(self.select_code))
    }

    pub fn interface_mut(&mut self) -> Result<&mut DiscInterface, DriverError> {
        self.backplane
            .card_as_mut::<DiscInterface>(self.select_code)
            .ok_or(DriverError::NoCard(self.select_code))
    }

    pub fn report(&self) -> Result<InterfaceReport, DriverError> {
        Ok(self.interface()?.report())
    }

    fn ctx(&self) -> Context {
        Context::new(self.clock.now(), self.started.elapsed())
    }

    /// Executes one I/O instruction on the card.
    fn io(&mut self, signals: InboundSignals, data: u16) -> Result<SignalsValue, DriverError> {
        self.clock.consume(&INSTRUCTION_TIME);
        let ctx = self.ctx();
        self.backplane.service(&ctx)?;
        Ok(self.backplane.io(&ctx, self.select_code, signals, data)?)
    }

    /// Runs the simulation forward until `ready` says the condition
    /// has been reached.
    fn wait_for<F>(&mut self, waiting_for: &'static str, mut ready: F) -> Result<(), DriverError>
    where
        F: FnMut(&mut HostDriver) -> Result<bool, DriverError>,
    {
        let deadline = self.clock.now() + self.timeout;
        loop {
            if ready(self)? {
                return Ok(());
            }
            match self.backplane.next_event_due() {
                Some(due) if due <= deadline => {
                    self.clock.advance_to(due);
                    let ctx = self.ctx();
                    self.backplane.service(&ctx)?;
                }
                _ => {
                    event!(Level::WARN, "timed out waiting for {}", waiting_for);
                    return Err(DriverError::Timeout { waiting_for });
                }
            }
        }
    }

    fn flag_set(&mut self) -> Result<bool, DriverError> {
        Ok(self
            .io(InboundSignals::SFS, 0)?
            .signals
            .contains(OutboundSignals::SKF))
    }

    fn write_control(&mut self, control: ControlWord) -> Result<(), DriverError> {
        self.io(InboundSignals::CLC, 0)?;
        self.io(InboundSignals::IOO, control.bits())?;
        self.io(InboundSignals::STC | InboundSignals::CLF, 0)?;
        Ok(())
    }

    /// Sends words through the FIFO and waits for the last byte to
    /// leave the card.
    fn send(&mut self, words: &[u16]) -> Result<(), DriverError> {
        self.write_control(ControlWord::CIC | ControlWord::TALK | ControlWord::LBO)?;
        for word in words {
            self.wait_for("room in the FIFO", |d| {
                Ok(d.backplane.dma_request(d.select_code))
            })?;
            self.io(InboundSignals::IOO, *word)?;
        }
        self.io(InboundSignals::EDT, 0)?;
        self.wait_for("the last byte to be sent", HostDriver::flag_set)
    }

    /// Reads bytes until one arrives with EOI, or `limit` bytes have
    /// arrived.
    fn receive(&mut self, limit: usize) -> Result<Vec<u8>, DriverError> {
        self.write_control(ControlWord::CIC | ControlWord::LSTN | ControlWord::IRL)?;
        let mut bytes = Vec::new();
        loop {
            self.wait_for("data from the drive", HostDriver::flag_set)?;
            let word = self.io(InboundSignals::IOI | InboundSignals::CLF, 0)?.value;
            bytes.push((word & 0xFF) as u8);
            if word & WORD_EOI != 0 || bytes.len() >= limit {
                return Ok(bytes);
            }
        }
    }

    /// Conducts a parallel poll and returns the response byte.
    pub fn parallel_poll(&mut self) -> Result<u8, DriverError> {
        self.write_control(ControlWord::CIC | ControlWord::ATN | ControlWord::EOI)?;
        let response = self.io(InboundSignals::IOI, 0)?.value;
        self.write_control(ControlWord::CIC)?;
        Ok((response & 0xFF) as u8)
    }

    fn wait_for_poll(&mut self) -> Result<(), DriverError> {
        let line = self.address.poll_line();
        self.wait_for("the parallel poll response", |d| {
            Ok(d.parallel_poll()? & line != 0)
        })
    }

    /// Powers up the system and clears the bus with IFC.  Returns the
    /// drive's power-on DSJ.
    pub fn preset(&mut self) -> Result<u8, DriverError> {
        let ctx = self.ctx();
        self.backplane.preset(&ctx)?;
        self.write_control(ControlWord::CIC | ControlWord::IFC)?;
        self.wait_for("the end of IFC", |d| {
            Ok(!d
                .interface()?
                .card()
                .status_word()
                .contains(StatusWord::IFC))
        })?;
        self.write_control(ControlWord::CIC)?;
        let dsj = self.dsj()?;
        event!(
            Level::INFO,
            "preset complete at {:?}; drive {} DSJ is {}",
            self.now(),
            self.address,
            dsj
        );
        Ok(dsj)
    }

    /// Returns the two-byte Amigo identification of the drive.
    pub fn identify(&mut self) -> Result<u16, DriverError> {
        self.send(&[
            command_word(UNT),
            command_word(UNL),
            command_word(SECONDARY_BASE | u8::from(self.address)),
        ])?;
        let bytes = self.receive(2)?;
        self.send(&[command_word(UNT)])?;
        let byte = |n: usize| bytes.get(n).copied().unwrap_or(0);
        Ok(u16::from_be_bytes([byte(0), byte(1)]))
    }

    /// Reads the drive's Device-Specified Jump byte.
    pub fn dsj(&mut self) -> Result<u8, DriverError> {
        self.send(&[
            command_word(UNL),
            command_word(TALK_BASE | u8::from(self.address)),
            command_word(SECONDARY_BASE | SECONDARY_DSJ),
        ])?;
        let bytes = self.receive(1)?;
        self.send(&[command_word(UNT)])?;
        Ok(bytes.first().copied().unwrap_or(0))
    }

    fn disc_command(&mut self, parameters: &[u8]) -> Result<(), DriverError> {
        let mut words = vec![
            command_word(UNL),
            command_word(LISTEN_BASE | u8::from(self.address)),
            command_word(SECONDARY_BASE | SECONDARY_COMMAND),
        ];
        words.extend(data_words(parameters));
        self.send(&words)
    }

    /// Fails with the drive's status if its DSJ is not zero.
    fn check(&mut self) -> Result<(), DriverError> {
        match self.dsj()? {
            0 => Ok(()),
            dsj => {
                let status = self.request_status()?;
                Err(DriverError::UnitError { dsj, status })
            }
        }
    }

    /// Returns the two Request Status words.
    pub fn request_status(&mut self) -> Result<[u16; 2], DriverError> {
        self.disc_command(&[Opcode::RequestStatus as u8, 0])?;
        self.send(&[
            command_word(UNL),
            command_word(TALK_BASE | u8::from(self.address)),
            command_word(SECONDARY_BASE | SECONDARY_COMMAND),
        ])?;
        let bytes = self.receive(4)?;
        self.send(&[command_word(UNT)])?;
        self.wait_for_poll()?;
        let mut status = [0_u16; 2];
        for (word, pair) in status.iter_mut().zip(bytes.chunks(2)) {
            *word = pair.iter().fold(0, |w, b| w << 8 | u16::from(*b));
        }
        Ok(status)
    }

    pub fn seek(&mut self, cylinder: u16, head: u8, sector: u8) -> Result<(), DriverError> {
        let [c_hi, c_lo] = cylinder.to_be_bytes();
        self.disc_command(&[Opcode::Seek as u8, 0, c_hi, c_lo, head, sector])?;
        self.wait_for_poll()?;
        self.check()
    }

    pub fn read_sector(
        &mut self,
        cylinder: u16,
        head: u8,
        sector: u8,
    ) -> Result<Vec<u16>, DriverError> {
        self.seek(cylinder, head, sector)?;
        self.disc_command(&[Opcode::Read as u8, 0])?;
        self.send(&[
            command_word(UNL),
            command_word(TALK_BASE | u8::from(self.address)),
            command_word(SECONDARY_BASE | SECONDARY_DATA),
        ])?;
        let bytes = self.receive(SECTOR_WORDS * 2)?;
        self.send(&[command_word(UNT)])?;
        self.wait_for_poll()?;
        self.check()?;
        Ok(bytes
            .chunks(2)
            .map(|pair| pair.iter().fold(0, |w, b| w << 8 | u16::from(*b)))
            .collect())
    }

    /// Writes `words` (at most a sector; the drive pads a short
    /// sector with zeros).
    pub fn write_sector(
        &mut self,
        cylinder: u16,
        head: u8,
        sector: u8,
        words: &[u16],
    ) -> Result<(), DriverError> {
        if words.is_empty() {
            // Nothing would carry EOI, and the drive would wait forever.
            return Err(DriverError::NothingToWrite);
        }
        self.seek(cylinder, head, sector)?;
        self.disc_command(&[Opcode::Write as u8, 0])?;
        let bytes: Vec<u8> = words
            .iter()
            .take(SECTOR_WORDS)
            .flat_map(|w| w.to_be_bytes())
            .collect();
        let mut out = vec![
            command_word(UNL),
            command_word(LISTEN_BASE | u8::from(self.address)),
            command_word(SECONDARY_BASE | SECONDARY_DATA),
        ];
        out.extend(data_words(&bytes));
        self.send(&out)?;
        self.wait_for_poll()?;
        self.check()
    }
}
