//! Backplane signal sets.
//!
//! Every interface card is driven by a set of concurrently asserted
//! inbound signals, and answers with a set of outbound signals.  The
//! bit position of an inbound signal is its processing priority: a
//! card handles the lowest-numbered asserted signal first, so the
//! numbering encodes the order in which the hardware would act on
//! them (for example CLF is numbered after SFS and SFC so that a
//! "skip if flag set, then clear flag" instruction tests the flag
//! before clearing it).
use std::fmt::{self, Display, Formatter};

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Signals sent from the CPU (or DMA channel) to a card.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct InboundSignals: u32 {
        /// Power-on normal.
        const PON   = 1 << 0;
        /// I/O data input (the CPU reads the card).
        const IOI   = 1 << 1;
        /// I/O data output (the CPU writes the card).
        const IOO   = 1 << 2;
        /// Skip if flag clear.
        const SFC   = 1 << 3;
        /// Skip if flag set.
        const SFS   = 1 << 4;
        /// Set control.
        const STC   = 1 << 5;
        /// Clear control.
        const CLC   = 1 << 6;
        /// Set flag.
        const STF   = 1 << 7;
        /// Clear flag.
        const CLF   = 1 << 8;
        /// End data transfer (from the DMA channel).
        const EDT   = 1 << 9;
        /// Control reset.
        const CRS   = 1 << 10;
        /// Power-on preset to I/O.
        const POPIO = 1 << 11;
        /// Interrupt acknowledge.
        const IAK   = 1 << 12;
        /// Enable flag (latch the flag buffer into the flag).
        const ENF   = 1 << 13;
        /// Set interrupt request.
        const SIR   = 1 << 14;
        /// Interrupt system enable.
        const IEN   = 1 << 15;
        /// Priority high (the card's interrupt priority input).
        const PRH   = 1 << 16;
    }
}

bitflags! {
    /// Signals sent from a card back to the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct OutboundSignals: u32 {
        /// Skip on flag.
        const SKF      = 1 << 0;
        /// Priority low (pass priority to the next card in the chain).
        const PRL      = 1 << 1;
        /// Flag.
        const FLG      = 1 << 2;
        /// Interrupt request.
        const IRQ      = 1 << 3;
        /// Service request (DMA).
        const SRQ      = 1 << 4;
        /// Conditional PRL: PRL unless an interrupt is pending.
        const CN_PRL   = 1 << 5;
        /// Conditional IRQ: IRQ if interrupts are enabled.
        const CN_IRQ   = 1 << 6;
        /// The conditional signals are valid.
        const CN_VALID = 1 << 7;
    }
}

/// A single inbound signal, as handed to a card's signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum InboundSignal {
    Pon,
    Ioi,
    Ioo,
    Sfc,
    Sfs,
    Stc,
    Clc,
    Stf,
    Clf,
    Edt,
    Crs,
    Popio,
    Iak,
    Enf,
    Sir,
    Ien,
    Prh,
}

const INBOUND_BY_BIT: [InboundSignal; 17] = [
    InboundSignal::Pon,
    InboundSignal::Ioi,
    InboundSignal::Ioo,
    InboundSignal::Sfc,
    InboundSignal::Sfs,
    InboundSignal::Stc,
    InboundSignal::Clc,
    InboundSignal::Stf,
    InboundSignal::Clf,
    InboundSignal::Edt,
    InboundSignal::Crs,
    InboundSignal::Popio,
    InboundSignal::Iak,
    InboundSignal::Enf,
    InboundSignal::Sir,
    InboundSignal::Ien,
    InboundSignal::Prh,
];

impl From<InboundSignal> for InboundSignals {
    fn from(signal: InboundSignal) -> InboundSignals {
        InboundSignals::from_bits_truncate(1 << (signal as u32))
    }
}

impl Display for InboundSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InboundSignal::Pon => "PON",
            InboundSignal::Ioi => "IOI",
            InboundSignal::Ioo => "IOO",
            InboundSignal::Sfc => "SFC",
            InboundSignal::Sfs => "SFS",
            InboundSignal::Stc => "STC",
            InboundSignal::Clc => "CLC",
            InboundSignal::Stf => "STF",
            InboundSignal::Clf => "CLF",
            InboundSignal::Edt => "EDT",
            InboundSignal::Crs => "CRS",
            InboundSignal::Popio => "POPIO",
            InboundSignal::Iak => "IAK",
            InboundSignal::Enf => "ENF",
            InboundSignal::Sir => "SIR",
            InboundSignal::Ien => "IEN",
            InboundSignal::Prh => "PRH",
        })
    }
}

impl InboundSignals {
    /// Yields the asserted signals one at a time, lowest-numbered
    /// (that is, highest-priority) first.
    pub fn by_priority(self) -> impl Iterator<Item = InboundSignal> {
        LowestFirst::new(self.bits())
            .filter_map(|bit| INBOUND_BY_BIT.get(bit.trailing_zeros() as usize).copied())
    }
}

/// Peels set bits off a word one at a time, lowest first.
#[derive(Debug, Clone)]
pub struct LowestFirst {
    remaining: u32,
}

impl LowestFirst {
    pub fn new(bits: u32) -> LowestFirst {
        LowestFirst { remaining: bits }
    }
}

impl Iterator for LowestFirst {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            None
        } else {
            // Two's complement isolates the lowest set bit.
            let lowest = self.remaining & (!self.remaining).wrapping_add(1);
            self.remaining &= !lowest;
            Some(lowest)
        }
    }
}

/// The result of a call to a card's interface function: the
/// outbound signals the card asserts and the value it places on the
/// I/O data bus (zero unless the card was asked for input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SignalsValue {
    pub signals: OutboundSignals,
    pub value: u16,
}

impl SignalsValue {
    pub fn new(signals: OutboundSignals, value: u16) -> SignalsValue {
        SignalsValue { signals, value }
    }
}
