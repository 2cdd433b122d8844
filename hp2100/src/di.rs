//! The 12821A HP-IB Disc Interface (DI) card.
//!
//! The card connects the CPU's I/O data bus to an HP-IB bus through
//! a 16-entry tagged FIFO.  The CPU writes the control word (with
//! the control flip-flop clear) to choose between talking and
//! listening and to drive the bus control lines, then moves data
//! through the FIFO (with control set).  Bytes the card talks are
//! sent to the bus as soon as the bus is ready for them; bytes it
//! hears are moved from the FIFO to the input data register one at a
//! time for the CPU to read.
//!
//! All of the card's reactions to a change (in the FIFO, the control
//! word or the bus) are computed in one place, [`DiCard::update_state`].
use std::time::Duration;

use bitflags::bitflags;
use serde::Serialize;
use tracing::{event, Level};

use base::prelude::*;

use crate::context::Context;
use crate::hpib::{originator_mask, Bus, BusCommand, BusLines, BusParticipant, Originator};
use crate::io::{dispatch, StandardFlags};
use crate::stop::Stop;

mod fifo;

pub use fifo::{BytePointer, Fifo, FifoAccess, FifoEntry, FifoStatus, Tags};

/// Number of entries in the card's FIFO.
pub const FIFO_SIZE: usize = 16;

/// How long the card holds IFC asserted.
pub const IFC_TIMEOUT: Duration = Duration::from_micros(100);

bitflags! {
    /// The control word, written by an output with control clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct ControlWord: u16 {
        /// Enable a flag on bus SRQ.
        const SRQ  = 0o100000;
        /// Assert IFC (system controller), or enable a flag on bus IFC.
        const IFC  = 0o040000;
        /// Assert REN (system controller), or enable a flag on bus REN.
        const REN  = 0o020000;
        /// Enable a flag when the input data register is loaded.
        const IRL  = 0o010000;
        /// Enable a flag when the last byte has been sent.
        const LBO  = 0o004000;
        /// A line feed received marks the last byte.
        const LF   = 0o002000;
        /// Send EOI with the last byte (and with ATN, poll).
        const EOI  = 0o001000;
        /// Assert ATN.
        const ATN  = 0o000400;
        /// Loop bytes the card sends back into its own FIFO.
        const DIAG = 0o000200;
        /// Hold NRFD asserted while listening.
        const NRFD = 0o000100;
        /// Respond to parallel polls.
        const PPE  = 0o000040;
        /// The last word holds only one byte.
        const ODD  = 0o000020;
        /// Two bytes per word.
        const PACK = 0o000010;
        const LSTN = 0o000004;
        const TALK = 0o000002;
        /// Controller in charge.
        const CIC  = 0o000001;
    }
}

bitflags! {
    /// The status word, read by an input with control clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct StatusWord: u16 {
        const SRQBUS = 0o100000;
        const IFCBUS = 0o040000;
        const RENBUS = 0o020000;
        /// Input data register loaded.
        const IRL    = 0o010000;
        /// Last byte out.
        const LBO    = 0o004000;
        /// Last byte in.
        const LBI    = 0o002000;
        const EOIBUS = 0o001000;
        const ATNBUS = 0o000400;
        /// The card is holding IFC asserted.
        const IFC    = 0o000200;
        /// An odd number of bytes was received.
        const ODD    = 0o000020;
        /// The card is the system controller.
        const SYSCTL = 0o000010;
        const LSTN   = 0o000004;
        const TALK   = 0o000002;
        const CIC    = 0o000001;
    }
}

/// The status bits the card stores; the others reflect the control
/// word, the bus or the configuration.
const STORED_STATUS: StatusWord = StatusWord::IRL
    .union(StatusWord::LBO)
    .union(StatusWord::LBI)
    .union(StatusWord::IFC)
    .union(StatusWord::ODD);

/// In unpacked mode a CPU word carries ATN and EOI for its byte in
/// bits 8 and 9.
const UNPACKED_ATN: u16 = 0o400;
const UNPACKED_EOI: u16 = 0o1000;

#[derive(Debug, Clone, Serialize)]
pub struct CardConfiguration {
    pub select_code: SelectCode,
    /// The system controller drives IFC and REN.
    pub system_controller: bool,
}

impl CardConfiguration {
    pub fn new(select_code: SelectCode) -> CardConfiguration {
        CardConfiguration {
            select_code,
            system_controller: true,
        }
    }
}

/// A snapshot of the card's registers, for display.
#[derive(Debug, Clone, Serialize)]
pub struct CardReport {
    pub flags: StandardFlags,
    pub control_word: ControlWord,
    pub status_word: StatusWord,
    pub input_data: u16,
    pub fifo_count: usize,
    pub srq: bool,
    pub bus: Bus,
}

#[derive(Debug)]
pub struct DiCard {
    name: String,
    config: CardConfiguration,
    flags: StandardFlags,
    control_word: ControlWord,
    /// Only the bits in `STORED_STATUS` are kept here.
    status: StatusWord,
    input_data: u16,
    fifo: Fifo,
    /// DCPC service request.
    srq: bool,
    /// End of data transfer.
    edt: bool,
    /// End of record; a one-shot flag source.
    eor: bool,
    ifc_deadline: Option<Duration>,
    bus: Bus,
    /// Devices (and, in bit 8, the card) holding NRFD asserted.
    nrfd_holders: u16,
    last_poll: Option<u8>,
}

const CONTROLLER_NRFD: u16 = 1 << 8;

impl DiCard {
    pub fn new(config: CardConfiguration) -> DiCard {
        DiCard::with_fifo_capacity(config, FIFO_SIZE)
    }

    pub fn with_fifo_capacity(config: CardConfiguration, capacity: usize) -> DiCard {
        DiCard {
            name: format!("DI {}", config.select_code),
            config,
            flags: StandardFlags::default(),
            control_word: ControlWord::empty(),
            status: StatusWord::empty(),
            input_data: 0,
            fifo: Fifo::with_capacity(capacity),
            srq: false,
            edt: false,
            eor: false,
            ifc_deadline: None,
            bus: Bus::default(),
            nrfd_holders: 0,
            last_poll: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CardConfiguration {
        &self.config
    }

    pub fn flags(&self) -> &StandardFlags {
        &self.flags
    }

    pub fn control_word(&self) -> ControlWord {
        self.control_word
    }

    pub fn fifo(&self) -> &Fifo {
        &self.fifo
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn lines(&self) -> BusLines {
        self.bus.lines
    }

    pub fn input_data(&self) -> u16 {
        self.input_data
    }

    pub fn service_request(&self) -> bool {
        self.srq
    }

    /// The response byte of the most recent parallel poll.
    pub fn last_poll(&self) -> Option<u8> {
        self.last_poll
    }

    pub fn ifc_deadline(&self) -> Option<Duration> {
        self.ifc_deadline
    }

    pub fn report(&self) -> CardReport {
        CardReport {
            flags: self.flags,
            control_word: self.control_word,
            status_word: self.status_word(),
            input_data: self.input_data,
            fifo_count: self.fifo.len(),
            srq: self.srq,
            bus: self.bus.clone(),
        }
    }

    // Addressing.  Devices call these when they decode their own
    // listen and talk addresses.

    pub fn attach_device(&mut self, address: BusAddress) {
        self.bus.acceptors |= address.bit();
    }

    pub fn detach_device(&mut self, address: BusAddress) {
        self.bus.remove(address);
        self.nrfd_holders &= !u16::from(address.bit());
    }

    pub fn listen(&mut self, address: BusAddress) {
        self.bus.listen(address);
    }

    pub fn unlisten(&mut self, address: BusAddress) {
        self.bus.unlisten(address);
    }

    pub fn talk(&mut self, address: BusAddress) {
        self.bus.talk(address);
    }

    pub fn untalk(&mut self, address: BusAddress) {
        self.bus.untalk(address);
    }

    /// The Card Interface Function.
    pub fn io(
        &mut self,
        device: &mut dyn BusParticipant,
        ctx: &Context,
        inbound: InboundSignals,
        data: u16,
    ) -> Result<SignalsValue, Stop> {
        let mut update_required = false;
        let result = dispatch(inbound, |signal, out| {
            // The card's reaction to this cycle must be known before
            // the flag is enabled and the interrupt requests are
            // computed.
            if update_required && signal >= InboundSignal::Enf {
                update_required = false;
                self.update_state(device, ctx)?;
            }
            match signal {
                InboundSignal::Pon => {
                    self.power_on();
                    update_required = true;
                }
                InboundSignal::Ioi => {
                    out.value = self.read_input();
                    update_required = true;
                }
                InboundSignal::Ioo => {
                    if self.flags.control {
                        self.fifo_load(data, FifoAccess::Cpu);
                    } else {
                        self.write_control(device, ctx, data)?;
                    }
                    update_required = true;
                }
                InboundSignal::Stc => {
                    self.edt = false;
                    update_required = true;
                }
                InboundSignal::Clc | InboundSignal::Clf => {
                    update_required = true;
                }
                InboundSignal::Edt => {
                    self.end_data_transfer();
                    update_required = true;
                }
                InboundSignal::Crs => {
                    self.master_reset(device, ctx)?;
                    update_required = true;
                }
                InboundSignal::Sir => {
                    if self.srq {
                        out.signals |= OutboundSignals::SRQ;
                    }
                }
                _ => (),
            }
            self.flags.handle(signal, inbound, out);
            Ok(())
        })?;
        if update_required {
            self.update_state(device, ctx)?;
        }
        Ok(result)
    }

    fn power_on(&mut self) {
        event!(Level::DEBUG, "{}: power on", self.name);
        self.bus.lines = BusLines::empty();
        self.nrfd_holders = 0;
        self.last_poll = None;
    }

    /// CRS: clear the card to its reset state and release the bus
    /// lines it drives.
    fn master_reset(&mut self, device: &mut dyn BusParticipant, ctx: &Context) -> Result<(), Stop> {
        event!(Level::DEBUG, "{}: control reset", self.name);
        self.control_word = ControlWord::empty();
        self.status = StatusWord::empty();
        self.input_data = 0;
        self.fifo.clear();
        self.srq = false;
        self.edt = false;
        self.eor = false;
        self.ifc_deadline = None;
        self.bus_control(
            device,
            ctx,
            Originator::Controller,
            BusLines::empty(),
            BusLines::ATN | BusLines::EOI | BusLines::REN | BusLines::IFC | BusLines::NRFD,
        )
    }

    fn read_input(&mut self) -> u16 {
        if self.flags.control {
            self.status.remove(StatusWord::IRL);
            event!(
                Level::TRACE,
                "{}: CPU reads data {:06o}",
                self.name,
                self.input_data
            );
            self.input_data
        } else {
            let status = self.status_word();
            event!(
                Level::TRACE,
                "{}: CPU reads status {:06o} ({:?})",
                self.name,
                status.bits(),
                status
            );
            status.bits()
        }
    }

    pub fn status_word(&self) -> StatusWord {
        let mut status = self.status & STORED_STATUS;
        if self.config.system_controller {
            status |= StatusWord::SYSCTL;
        }
        for (control, reflected) in [
            (ControlWord::LSTN, StatusWord::LSTN),
            (ControlWord::TALK, StatusWord::TALK),
            (ControlWord::CIC, StatusWord::CIC),
        ] {
            if self.control_word.contains(control) {
                status |= reflected;
            }
        }
        for (line, reflected) in [
            (BusLines::SRQ, StatusWord::SRQBUS),
            (BusLines::IFC, StatusWord::IFCBUS),
            (BusLines::REN, StatusWord::RENBUS),
            (BusLines::EOI, StatusWord::EOIBUS),
            (BusLines::ATN, StatusWord::ATNBUS),
        ] {
            if self.bus.lines.contains(line) {
                status |= reflected;
            }
        }
        status
    }

    fn write_control(
        &mut self,
        device: &mut dyn BusParticipant,
        ctx: &Context,
        data: u16,
    ) -> Result<(), Stop> {
        let old = self.control_word;
        let new = ControlWord::from_bits_truncate(data);
        event!(
            Level::DEBUG,
            "{}: control word {:06o} ({:?})",
            self.name,
            new.bits(),
            new
        );
        self.control_word = new;
        self.status.remove(StatusWord::LBO | StatusWord::LBI | StatusWord::ODD);
        if old.contains(ControlWord::PACK) != new.contains(ControlWord::PACK) {
            self.fifo.reset_pointers();
        }

        let mut assert = BusLines::empty();
        let mut deny = BusLines::empty();
        if self.config.system_controller {
            if new.contains(ControlWord::REN) {
                assert |= BusLines::REN;
            } else {
                deny |= BusLines::REN;
            }
            if new.contains(ControlWord::IFC) && !old.contains(ControlWord::IFC) {
                assert |= BusLines::IFC;
                self.status |= StatusWord::IFC;
                self.ifc_deadline = Some(ctx.after(IFC_TIMEOUT));
            }
        }
        if new.contains(ControlWord::CIC) {
            if new.contains(ControlWord::ATN) {
                assert |= BusLines::ATN;
                if new.contains(ControlWord::EOI) {
                    assert |= BusLines::EOI;
                } else {
                    deny |= BusLines::EOI;
                }
            } else {
                deny |= BusLines::ATN | BusLines::EOI;
            }
        } else if old.contains(ControlWord::CIC) {
            deny |= BusLines::ATN | BusLines::EOI;
        }
        self.bus_control(device, ctx, Originator::Controller, assert, deny)
    }

    fn end_data_transfer(&mut self) {
        self.edt = true;
        if self.control_word.contains(ControlWord::TALK) {
            let mut tags = Tags::EDT;
            if self.control_word.contains(ControlWord::EOI) {
                tags |= Tags::EOI;
            }
            if !self.fifo.tag_newest(tags) {
                // Everything has already gone out.
                self.status |= StatusWord::LBO;
            }
        } else if self.control_word.contains(ControlWord::LSTN) {
            self.eor = true;
        }
    }

    /// Puts a word or byte into the FIFO.  Loading a full FIFO does
    /// nothing.
    pub fn fifo_load(&mut self, data: u16, access: FifoAccess) {
        let packed = self.control_word.contains(ControlWord::PACK);
        let loaded = match access {
            FifoAccess::Cpu => {
                let (word, tags) = if packed {
                    let tags = if self.control_word.contains(ControlWord::ATN) {
                        Tags::ATN
                    } else {
                        Tags::empty()
                    };
                    (data, tags)
                } else {
                    let mut tags = Tags::empty();
                    if data & UNPACKED_ATN != 0 {
                        tags |= Tags::ATN;
                    }
                    if data & UNPACKED_EOI != 0 {
                        tags |= Tags::EOI;
                    }
                    (data & 0xFF, tags)
                };
                self.fifo.push_word(word, tags)
            }
            FifoAccess::Bus | FifoAccess::Diagnostic => {
                let byte = (data & 0xFF) as u8;
                let mut tags = Tags::empty();
                if self.bus.lines.contains(BusLines::ATN) {
                    tags |= Tags::ATN;
                }
                if self.bus.lines.contains(BusLines::EOI) {
                    tags |= Tags::EOI;
                }
                if tags.contains(Tags::EOI)
                    || (self.control_word.contains(ControlWord::LF) && byte == b'\n')
                {
                    tags |= Tags::LBR;
                }
                let loaded = if access == FifoAccess::Diagnostic {
                    self.fifo.push_word(u16::from(byte) << 8 | u16::from(byte), tags)
                } else {
                    self.fifo.push_byte(byte, tags, packed)
                };
                if loaded
                    && packed
                    && access == FifoAccess::Bus
                    && tags.contains(Tags::LBR)
                    && self.fifo.input_pointer() == BytePointer::Lower
                {
                    self.fifo.complete_entry();
                    self.status |= StatusWord::ODD;
                }
                loaded
            }
        };
        if loaded {
            event!(
                Level::TRACE,
                "{}: {:?} load {:06o}, FIFO now holds {}",
                self.name,
                access,
                data,
                self.fifo.len()
            );
        } else {
            event!(
                Level::WARN,
                "{}: {:?} load {:06o} discarded; the FIFO is full",
                self.name,
                access,
                data
            );
        }
    }

    /// Takes a word (CPU and diagnostic access) or byte (bus access)
    /// out of the FIFO.  Unloading an empty FIFO returns zero and
    /// changes nothing.
    pub fn fifo_unload(&mut self, access: FifoAccess) -> (u16, Tags) {
        let packed = self.control_word.contains(ControlWord::PACK);
        let unloaded = match access {
            FifoAccess::Bus => {
                let odd = self.control_word.contains(ControlWord::ODD);
                self.fifo
                    .pop_byte(packed, odd)
                    .map(|(byte, tags)| (u16::from(byte), tags))
            }
            FifoAccess::Cpu => self.fifo.pop_word().map(|entry| {
                let tags = entry.tags();
                let mut word = entry.data();
                if !packed {
                    word &= 0xFF;
                    if tags.contains(Tags::ATN) {
                        word |= UNPACKED_ATN;
                    }
                    if tags.contains(Tags::EOI) {
                        word |= UNPACKED_EOI;
                    }
                }
                (word, tags)
            }),
            FifoAccess::Diagnostic => self
                .fifo
                .pop_word()
                .map(|entry| (entry.data(), entry.tags())),
        };
        match unloaded {
            Some((value, tags)) => {
                event!(
                    Level::TRACE,
                    "{}: {:?} unload {:06o} {:?}, FIFO now holds {}",
                    self.name,
                    access,
                    value,
                    tags,
                    self.fifo.len()
                );
                (value, tags)
            }
            None => {
                event!(
                    Level::WARN,
                    "{}: {:?} unload from an empty FIFO",
                    self.name,
                    access
                );
                (0, Tags::empty())
            }
        }
    }

    /// Performs card activity which is due by `ctx.simulated_time`
    /// (the end of an IFC pulse).
    pub fn service(&mut self, device: &mut dyn BusParticipant, ctx: &Context) -> Result<(), Stop> {
        self.update_state(device, ctx)
    }

    /// Brings the card up to date after anything which could change
    /// the FIFO, the control word or the bus.
    pub fn update_state(
        &mut self,
        device: &mut dyn BusParticipant,
        ctx: &Context,
    ) -> Result<(), Stop> {
        let listening = self.control_word.contains(ControlWord::LSTN);
        let talking = self.control_word.contains(ControlWord::TALK);

        if listening && !self.status.contains(StatusWord::IRL) && self.fifo.word_available() {
            let (word, tags) = self.fifo_unload(FifoAccess::Cpu);
            self.input_data = word;
            self.status |= StatusWord::IRL;
            if tags.contains(Tags::LBR) {
                self.status |= StatusWord::LBI;
            }
        } else if talking
            && !self.bus.lines.is_polling()
            && !self.status.contains(StatusWord::LBO)
        {
            self.source_from_fifo(device, ctx)?;
        }

        if let Some(deadline) = self.ifc_deadline {
            if ctx.simulated_time >= deadline {
                event!(Level::DEBUG, "{}: IFC pulse ends", self.name);
                self.ifc_deadline = None;
                self.status.remove(StatusWord::IFC);
                self.bus_control(
                    device,
                    ctx,
                    Originator::Controller,
                    BusLines::empty(),
                    BusLines::IFC,
                )?;
            }
        }

        let hold_off = listening
            && (self.control_word.contains(ControlWord::NRFD)
                || self.status.contains(StatusWord::LBI)
                || self.fifo.is_full());
        let (assert, deny) = if hold_off {
            (BusLines::NRFD, BusLines::empty())
        } else {
            (BusLines::empty(), BusLines::NRFD)
        };
        self.bus_control(device, ctx, Originator::Controller, assert, deny)?;

        let srq = (listening && self.status.contains(StatusWord::IRL))
            || (talking && !self.fifo.is_full());
        let srq_changed = srq != self.srq;
        if srq_changed {
            event!(
                Level::DEBUG,
                "{}: DCPC service request {}",
                self.name,
                if srq { "asserted" } else { "denied" }
            );
            self.srq = srq;
        }

        if self.flag_condition() {
            event!(Level::TRACE, "{}: flag set", self.name);
            self.flags.flag_buffer = true;
            self.flags.flag = true;
        } else if srq_changed {
            event!(
                Level::TRACE,
                "{}: interrupt requests change with SRQ",
                self.name
            );
        }
        Ok(())
    }

    fn flag_condition(&mut self) -> bool {
        let cntl = self.control_word;
        let lines = self.bus.lines;
        let end_of_record = std::mem::take(&mut self.eor);
        (cntl.contains(ControlWord::IRL) && self.status.contains(StatusWord::IRL))
            || (cntl.contains(ControlWord::LBO) && self.status.contains(StatusWord::LBO))
            || end_of_record
            || (cntl.contains(ControlWord::SRQ)
                && !cntl.contains(ControlWord::CIC)
                && lines.contains(BusLines::SRQ))
            || (!self.config.system_controller
                && ((cntl.contains(ControlWord::REN) && lines.contains(BusLines::REN))
                    || (cntl.contains(ControlWord::IFC) && lines.contains(BusLines::IFC))))
    }

    /// Sends bytes from the FIFO until it is empty, the bus is not
    /// ready, or the last byte has gone.
    fn source_from_fifo(
        &mut self,
        device: &mut dyn BusParticipant,
        ctx: &Context,
    ) -> Result<(), Stop> {
        while !self.fifo.is_empty()
            && !self.bus.lines.contains(BusLines::NRFD)
            && !self.bus.lines.is_polling()
            && !self.status.contains(StatusWord::LBO)
        {
            let (value, tags) = self.fifo_unload(FifoAccess::Bus);
            let byte = (value & 0xFF) as u8;
            if tags.contains(Tags::ATN | Tags::EOI) {
                // ATN with EOI is a parallel poll, not a byte.
                event!(
                    Level::DEBUG,
                    "{}: byte {:03o} tagged ATN and EOI conducts a poll",
                    self.name,
                    byte
                );
                self.bus_control(
                    device,
                    ctx,
                    Originator::Controller,
                    BusLines::ATN | BusLines::EOI,
                    BusLines::empty(),
                )?;
                continue;
            }
            let mut assert = BusLines::empty();
            if tags.contains(Tags::ATN) {
                assert |= BusLines::ATN;
            }
            if tags.contains(Tags::EOI) {
                assert |= BusLines::EOI;
            }
            let deny = (BusLines::ATN | BusLines::EOI) - assert;
            self.bus_control(device, ctx, Originator::Controller, assert, deny)?;
            self.bus_source(device, ctx, Originator::Controller, byte)?;
            if tags.contains(Tags::EDT) {
                self.status |= StatusWord::LBO;
            }
            if self.control_word.contains(ControlWord::DIAG) {
                // The byte came straight back into the FIFO.
                break;
            }
        }
        Ok(())
    }

    /// Sends one byte on the bus.  With ATN asserted the byte is a
    /// command and goes to every device (addressed commands only to
    /// listeners); otherwise it is data and goes to the listeners.
    /// Returns true if anything accepted the byte.
    pub fn bus_source(
        &mut self,
        device: &mut dyn BusParticipant,
        ctx: &Context,
        originator: Originator,
        byte: u8,
    ) -> Result<bool, Stop> {
        let lines = self.bus.lines;
        if lines.is_polling() {
            event!(
                Level::WARN,
                "{}: {} tried to send {:03o} during a parallel poll",
                self.name,
                originator,
                byte
            );
            return Ok(false);
        }
        if lines.contains(BusLines::ATN) {
            event!(
                Level::TRACE,
                "{}: {} sends {}",
                self.name,
                originator,
                BusCommand::from(byte)
            );
        } else {
            event!(
                Level::TRACE,
                "{}: {} sends data {:03o}{}",
                self.name,
                originator,
                byte,
                if lines.contains(BusLines::EOI) { " with EOI" } else { "" }
            );
        }

        let mut accepted = false;
        match originator {
            Originator::Controller => {
                if self.control_word.contains(ControlWord::DIAG) {
                    self.fifo_load(u16::from(byte), FifoAccess::Diagnostic);
                    accepted = true;
                }
            }
            Originator::Device(_) => {
                if self.control_word.contains(ControlWord::LSTN) {
                    self.fifo_load(u16::from(byte), FifoAccess::Bus);
                    accepted = true;
                }
            }
        }

        let recipients = self.bus.recipients(byte) & originator_mask(originator);
        for address in BusAddress::in_bitmap(recipients) {
            if device.accept(self, ctx, address, byte)? {
                accepted = true;
            }
        }
        if !accepted {
            event!(
                Level::WARN,
                "{}: nothing accepted {:03o} from {}",
                self.name,
                byte,
                originator
            );
        }
        if matches!(originator, Originator::Device(_)) {
            self.update_state(device, ctx)?;
        }
        Ok(accepted)
    }

    /// Asserts and denies bus control lines on behalf of
    /// `originator`; an assertion wins over a denial of the same line.
    /// NRFD is wired-OR: it stays asserted while the controller or any
    /// device still holds it, whoever else releases it.
    pub fn bus_control(
        &mut self,
        device: &mut dyn BusParticipant,
        ctx: &Context,
        originator: Originator,
        assert: BusLines,
        deny: BusLines,
    ) -> Result<(), Stop> {
        let holder = match originator {
            Originator::Controller => CONTROLLER_NRFD,
            Originator::Device(address) => u16::from(address.bit()),
        };
        if assert.contains(BusLines::NRFD) {
            self.nrfd_holders |= holder;
        } else if deny.contains(BusLines::NRFD) {
            self.nrfd_holders &= !holder;
        }
        let (mut assert, mut deny) = (assert - BusLines::NRFD, deny - BusLines::NRFD);
        if self.nrfd_holders != 0 {
            assert |= BusLines::NRFD;
        } else {
            deny |= BusLines::NRFD;
        }

        let Some(old) = self.bus.merge(assert, deny) else {
            return Ok(());
        };
        let new = self.bus.lines;
        event!(
            Level::DEBUG,
            "{}: {} changes bus lines from {:?} to {:?}",
            self.name,
            originator,
            old,
            new
        );
        let asserted = new - old;
        let denied = old - new;
        if asserted.contains(BusLines::IFC) {
            self.bus.unaddress_all();
        }
        if new.is_polling() {
            if !old.is_polling() {
                self.parallel_poll();
            }
        } else if asserted.contains(BusLines::IFC)
            || denied.intersects(BusLines::ATN | BusLines::NRFD)
            || self.control_word.contains(ControlWord::DIAG)
        {
            let recipients = self.bus.acceptors & originator_mask(originator);
            for address in BusAddress::in_bitmap(recipients) {
                device.respond(self, ctx, address, new)?;
            }
        }
        if matches!(originator, Originator::Device(_)) {
            self.update_state(device, ctx)?;
        }
        Ok(())
    }

    /// Sets or clears the parallel poll response of the device at
    /// `address`.  If a poll is in progress it is conducted again, so
    /// that the change is seen.
    pub fn poll_response(&mut self, address: BusAddress, respond: bool) {
        if respond {
            self.bus.poll_response |= address.bit();
        } else {
            self.bus.poll_response &= !address.bit();
        }
        if self.bus.lines.is_polling() {
            self.parallel_poll();
        }
    }

    fn parallel_poll(&mut self) {
        let response = self.bus.poll_byte();
        event!(
            Level::DEBUG,
            "{}: parallel poll response {:08b}",
            self.name,
            response
        );
        self.last_poll = Some(response);
        if self.control_word.contains(ControlWord::CIC) {
            self.input_data = u16::from(response);
            self.status |= StatusWord::IRL;
        }
    }
}
