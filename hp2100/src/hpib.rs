//! The HP-IB (IEEE-488) bus which connects a disc interface card to
//! its drives.
//!
//! The card is always the bus controller.  Each drive on the bus is
//! identified by its [`BusAddress`] and is represented by one bit in
//! the per-card acceptor, listener, talker and poll-response maps
//! held in [`Bus`].  The operations which move bytes and change
//! control lines live on the card ([`crate::di::DiCard`]), because
//! the card's own FIFO takes part in every transfer; the devices
//! reach the bus through the [`BusParticipant`] trait.
use std::fmt::{self, Display, Formatter};

use bitflags::bitflags;
use serde::Serialize;
use tracing::{event, Level};

use base::prelude::*;

use crate::context::Context;
use crate::di::DiCard;
use crate::stop::Stop;

#[cfg(test)]
mod tests;

bitflags! {
    /// Bus control lines.  DAV and NDAC are implicit in the byte
    /// handshake and are not represented.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct BusLines: u8 {
        const ATN  = 1 << 0;
        const EOI  = 1 << 1;
        const NRFD = 1 << 2;
        const REN  = 1 << 3;
        const IFC  = 1 << 4;
        const SRQ  = 1 << 5;
    }
}

impl BusLines {
    /// ATN and EOI asserted together conduct a parallel poll.
    pub fn is_polling(&self) -> bool {
        self.contains(BusLines::ATN | BusLines::EOI)
    }
}

/// The party changing the bus state: the interface card (acting as
/// controller) or one of the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Originator {
    Controller,
    Device(BusAddress),
}

impl Originator {
    fn bit(&self) -> u8 {
        match self {
            Originator::Controller => 0,
            Originator::Device(address) => address.bit(),
        }
    }
}

impl Display for Originator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Originator::Controller => f.write_str("controller"),
            Originator::Device(address) => write!(f, "device {address}"),
        }
    }
}

/// Addressed commands (primary commands 0x00 to 0x0F).  They apply
/// only to the devices currently addressed to listen.
pub const GTL: u8 = 0x01;
pub const SDC: u8 = 0x04;
pub const PPC: u8 = 0x05;
pub const GET: u8 = 0x08;
pub const TCT: u8 = 0x09;

/// Universal commands (primary commands 0x10 to 0x1F).
pub const LLO: u8 = 0x11;
pub const DCL: u8 = 0x14;
pub const PPU: u8 = 0x15;
pub const SPE: u8 = 0x18;
pub const SPD: u8 = 0x19;

pub const UNL: u8 = 0x3F;
pub const UNT: u8 = 0x5F;

/// Base of the listen, talk and secondary address groups.
pub const LISTEN_BASE: u8 = 0x20;
pub const TALK_BASE: u8 = 0x40;
pub const SECONDARY_BASE: u8 = 0x60;

/// A byte sent with ATN asserted, decoded.  The parity bit (bit 7)
/// is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusCommand {
    /// Addressed command group.
    Addressed(u8),
    /// Universal command group.
    Universal(u8),
    Listen(u8),
    Unlisten,
    Talk(u8),
    Untalk,
    Secondary(u8),
}

impl From<u8> for BusCommand {
    fn from(byte: u8) -> BusCommand {
        let byte = byte & 0x7F;
        match byte {
            0x00..=0x0F => BusCommand::Addressed(byte),
            0x10..=0x1F => BusCommand::Universal(byte),
            UNL => BusCommand::Unlisten,
            0x20..=0x3E => BusCommand::Listen(byte - LISTEN_BASE),
            UNT => BusCommand::Untalk,
            0x40..=0x5E => BusCommand::Talk(byte - TALK_BASE),
            _ => BusCommand::Secondary(byte - SECONDARY_BASE),
        }
    }
}

impl Display for BusCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BusCommand::Addressed(SDC) => f.write_str("SDC"),
            BusCommand::Addressed(GET) => f.write_str("GET"),
            BusCommand::Addressed(code) => write!(f, "ACG {code:02X}"),
            BusCommand::Universal(DCL) => f.write_str("DCL"),
            BusCommand::Universal(PPU) => f.write_str("PPU"),
            BusCommand::Universal(code) => write!(f, "UCG {code:02X}"),
            BusCommand::Listen(address) => write!(f, "MLA {address}"),
            BusCommand::Unlisten => f.write_str("UNL"),
            BusCommand::Talk(address) => write!(f, "MTA {address}"),
            BusCommand::Untalk => f.write_str("UNT"),
            BusCommand::Secondary(code) => write!(f, "SCG {code:02X}"),
        }
    }
}

/// The state of one card's bus: its control lines and the addressing
/// of the devices attached to it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Bus {
    pub lines: BusLines,
    /// Devices attached to the bus.
    pub acceptors: u8,
    /// Devices addressed to listen.
    pub listeners: u8,
    /// The device addressed to talk (at most one bit is set).
    pub talker: u8,
    /// Devices which will respond to a parallel poll.
    pub poll_response: u8,
}

impl Bus {
    pub fn is_acceptor(&self, address: BusAddress) -> bool {
        self.acceptors & address.bit() != 0
    }

    pub fn is_listener(&self, address: BusAddress) -> bool {
        self.listeners & address.bit() != 0
    }

    pub fn is_talker(&self, address: BusAddress) -> bool {
        self.talker & address.bit() != 0
    }

    /// Addresses a device to listen.  A device cannot listen and talk
    /// at once.
    pub fn listen(&mut self, address: BusAddress) {
        self.listeners |= address.bit();
        self.talker &= !address.bit();
    }

    pub fn unlisten(&mut self, address: BusAddress) {
        self.listeners &= !address.bit();
    }

    /// Addresses a device to talk.  Any other talker is unaddressed.
    pub fn talk(&mut self, address: BusAddress) {
        self.talker = address.bit();
        self.listeners &= !address.bit();
    }

    pub fn untalk(&mut self, address: BusAddress) {
        self.talker &= !address.bit();
    }

    /// Unaddresses every device, as IFC does.
    pub fn unaddress_all(&mut self) {
        self.listeners = 0;
        self.talker = 0;
    }

    /// Removes a device from the bus entirely.
    pub fn remove(&mut self, address: BusAddress) {
        let keep = !address.bit();
        self.acceptors &= keep;
        self.listeners &= keep;
        self.talker &= keep;
        self.poll_response &= keep;
    }

    /// Returns the devices which should be offered `byte`, given the
    /// current state of ATN.  Commands go to every acceptor except
    /// that addressed commands only go to listeners; data goes to
    /// listeners.
    pub fn recipients(&self, byte: u8) -> u8 {
        if self.lines.contains(BusLines::ATN) {
            match BusCommand::from(byte) {
                BusCommand::Addressed(_) => self.listeners & self.acceptors,
                _ => self.acceptors,
            }
        } else {
            self.listeners & self.acceptors
        }
    }

    /// Computes the parallel poll response byte: each responding
    /// device drives the data line matching its address.
    pub fn poll_byte(&self) -> u8 {
        BusAddress::in_bitmap(self.poll_response & self.acceptors)
            .fold(0, |byte, address| byte | address.poll_line())
    }

    /// Applies an assert/deny request to the control lines, assert
    /// taking precedence.  Returns the previous lines if anything
    /// changed.
    pub fn merge(&mut self, assert: BusLines, deny: BusLines) -> Option<BusLines> {
        let old = self.lines;
        let new = (old - deny) | assert;
        if new == old {
            None
        } else {
            event!(
                Level::TRACE,
                "bus lines changed from {:?} to {:?}",
                old,
                new
            );
            self.lines = new;
            Some(old)
        }
    }
}

/// A device attached to a disc interface's bus.  A single value
/// implementing this trait stands for every device on one card; the
/// `address` argument says which of them is being addressed.
pub trait BusParticipant {
    /// Offers a byte sent on the bus to the device at `address`.
    /// Returns true if the device accepted it.
    fn accept(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        address: BusAddress,
        byte: u8,
    ) -> Result<bool, Stop>;

    /// Tells the device at `address` that the bus control lines
    /// changed in a way it may need to act on (IFC asserted, ATN or
    /// NRFD denied).
    fn respond(
        &mut self,
        card: &mut DiCard,
        ctx: &Context,
        address: BusAddress,
        lines: BusLines,
    ) -> Result<(), Stop>;
}

/// Stands for an empty bus.
#[derive(Debug, Default)]
pub struct NoDevices;

impl BusParticipant for NoDevices {
    fn accept(
        &mut self,
        _card: &mut DiCard,
        _ctx: &Context,
        _address: BusAddress,
        _byte: u8,
    ) -> Result<bool, Stop> {
        Ok(false)
    }

    fn respond(
        &mut self,
        _card: &mut DiCard,
        _ctx: &Context,
        _address: BusAddress,
        _lines: BusLines,
    ) -> Result<(), Stop> {
        Ok(())
    }
}

pub(crate) fn originator_mask(originator: Originator) -> u8 {
    !originator.bit()
}
