//! This module simulates the HP 2100 I/O backplane: the signals the
//! CPU sends to interface cards, and the behaviours which every card
//! shares.
//!
//! ## The Card Interface Function
//!
//! Each card has a single entry point, [`IoCard::io`].  It is handed
//! the set of inbound signals asserted in one I/O cycle plus the
//! value on the I/O data bus, and returns the outbound signals it
//! asserts plus the value it places on the data bus.  The inbound
//! signals are always processed lowest-numbered first (see
//! [`InboundSignals`]) by [`dispatch`].
//!
//! ## Interrupts
//!
//! A card answers SIR with *conditional* interrupt signals (CN_IRQ,
//! CN_PRL and CN_VALID).  They are resolved into IRQ and PRL when
//! PRH arrives in the same call, by which time IEN is known.  That
//! lets the backplane walk the priority chain one card at a time.
//!
//! | Card state                      | SIR result       | With PRH, IEN        |
//! | ------------------------------- | ---------------- | -------------------- |
//! | control, flag and flag buffer   | CN_IRQ           | IRQ (PRL held low)   |
//! | control and flag (acknowledged) | (none)           | PRL held low         |
//! | otherwise                       | CN_PRL           | PRL                  |
use std::any::Any;
use std::time::Duration;

use serde::Serialize;
use tracing::{event, Level};

use base::prelude::*;

use crate::context::Context;
use crate::stop::Stop;

mod backplane;
#[cfg(test)]
mod tests;

pub use backplane::Backplane;

/// An interface card plugged into the backplane.
pub trait IoCard {
    /// A short name used in diagnostics, e.g. "DI".
    fn name(&self) -> String;

    /// The Card Interface Function.
    fn io(
        &mut self,
        ctx: &Context,
        inbound: InboundSignals,
        data: u16,
    ) -> Result<SignalsValue, Stop>;

    /// Performs whatever device activity has become due by
    /// `ctx.simulated_time`.
    fn service(&mut self, _ctx: &Context) -> Result<(), Stop> {
        Ok(())
    }

    /// Returns the simulated time at which the card next needs
    /// [`IoCard::service`] to be called, if ever.
    fn next_event_due(&self) -> Option<Duration> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// The control, flag and flag buffer flip-flops present on every
/// interface card.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StandardFlags {
    pub control: bool,
    pub flag: bool,
    pub flag_buffer: bool,
}

impl StandardFlags {
    /// Applies the effect which `signal` has on every card.  Cards
    /// call this for every signal, after performing any action of
    /// their own.
    pub fn handle(
        &mut self,
        signal: InboundSignal,
        inbound: InboundSignals,
        out: &mut SignalsValue,
    ) {
        match signal {
            InboundSignal::Sfc => {
                if !self.flag {
                    out.signals |= OutboundSignals::SKF;
                }
            }
            InboundSignal::Sfs => {
                if self.flag {
                    out.signals |= OutboundSignals::SKF;
                }
            }
            InboundSignal::Stc => {
                self.control = true;
            }
            InboundSignal::Clc | InboundSignal::Crs => {
                self.control = false;
            }
            InboundSignal::Stf | InboundSignal::Popio => {
                self.flag_buffer = true;
            }
            InboundSignal::Clf => {
                self.flag_buffer = false;
                self.flag = false;
            }
            InboundSignal::Enf => {
                if self.flag_buffer {
                    self.flag = true;
                }
            }
            InboundSignal::Iak => {
                self.flag_buffer = false;
            }
            InboundSignal::Sir => {
                out.signals |= OutboundSignals::CN_VALID;
                if self.control && self.flag && self.flag_buffer {
                    out.signals |= OutboundSignals::CN_IRQ;
                }
                if !(self.control && self.flag) {
                    out.signals |= OutboundSignals::CN_PRL;
                }
            }
            InboundSignal::Prh => {
                resolve_priority(inbound, out);
            }
            InboundSignal::Pon
            | InboundSignal::Ioi
            | InboundSignal::Ioo
            | InboundSignal::Edt
            | InboundSignal::Ien => (),
        }
    }
}

/// Turns the conditional interrupt signals into IRQ and PRL, now
/// that the card has priority and the state of the interrupt system
/// is known.
fn resolve_priority(inbound: InboundSignals, out: &mut SignalsValue) {
    if !out.signals.contains(OutboundSignals::CN_VALID) {
        event!(
            Level::TRACE,
            "PRH without SIR; conditional signals are not valid"
        );
        return;
    }
    let enabled = inbound.contains(InboundSignals::IEN);
    if enabled && out.signals.contains(OutboundSignals::CN_IRQ) {
        out.signals |= OutboundSignals::IRQ;
    }
    if !enabled || out.signals.contains(OutboundSignals::CN_PRL) {
        out.signals |= OutboundSignals::PRL;
    }
}

/// Handles each asserted signal in priority order, lowest-numbered
/// first, accumulating the outbound signals and data value.
pub fn dispatch<F>(inbound: InboundSignals, mut handler: F) -> Result<SignalsValue, Stop>
where
    F: FnMut(InboundSignal, &mut SignalsValue) -> Result<(), Stop>,
{
    let mut result = SignalsValue::default();
    for signal in inbound.by_priority() {
        handler(signal, &mut result)?;
    }
    Ok(result)
}
