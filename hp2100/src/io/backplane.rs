use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use tracing::{event, span, Level};

use base::prelude::*;

use super::IoCard;
use crate::context::Context;
use crate::stop::Stop;

/// Holds the interface cards, keyed by select code.  Does not
/// correspond to a single tangible component; it stands for the
/// backplane wiring plus the parts of the CPU which drive it
/// (the interrupt system and the priority chain).
pub struct Backplane {
    cards: BTreeMap<SelectCode, Box<dyn IoCard>>,
    interrupt_system: bool,
    /// Outbound signals of each card as of the most recent SIR.
    requests: BTreeMap<SelectCode, OutboundSignals>,
}

impl Debug for Backplane {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let names: BTreeMap<&SelectCode, String> =
            self.cards.iter().map(|(sc, card)| (sc, card.name())).collect();
        f.debug_struct("Backplane")
            .field("cards", &names)
            .field("interrupt_system", &self.interrupt_system)
            .field("requests", &self.requests)
            .finish()
    }
}

impl Default for Backplane {
    fn default() -> Self {
        Self::new()
    }
}

impl Backplane {
    pub fn new() -> Backplane {
        Backplane {
            cards: BTreeMap::new(),
            interrupt_system: false,
            requests: BTreeMap::new(),
        }
    }

    /// Plugs `card` in at `select_code`, returning the card which was
    /// there before, if any.
    pub fn attach(
        &mut self,
        select_code: SelectCode,
        card: Box<dyn IoCard>,
    ) -> Option<Box<dyn IoCard>> {
        event!(
            Level::INFO,
            "attaching {} at select code {}",
            card.name(),
            select_code
        );
        self.requests.remove(&select_code);
        self.cards.insert(select_code, card)
    }

    pub fn card(&self, select_code: SelectCode) -> Option<&dyn IoCard> {
        self.cards.get(&select_code).map(|card| card.as_ref())
    }

    /// Returns the card at `select_code` if it is of type `T`.
    pub fn card_as<T: 'static>(&self, select_code: SelectCode) -> Option<&T> {
        self.cards
            .get(&select_code)
            .and_then(|card| card.as_any().downcast_ref::<T>())
    }

    /// Returns the card at `select_code` if it is of type `T`.
    pub fn card_as_mut<T: 'static>(&mut self, select_code: SelectCode) -> Option<&mut T> {
        self.cards
            .get_mut(&select_code)
            .and_then(|card| card.as_any_mut().downcast_mut::<T>())
    }

    pub fn set_interrupt_system(&mut self, enabled: bool) {
        self.interrupt_system = enabled;
    }

    pub fn interrupt_system(&self) -> bool {
        self.interrupt_system
    }

    fn housekeeping_signals(&self) -> InboundSignals {
        if self.interrupt_system {
            InboundSignals::ENF | InboundSignals::SIR | InboundSignals::IEN
        } else {
            InboundSignals::ENF | InboundSignals::SIR
        }
    }

    /// Performs one I/O cycle on the card at `select_code`.  Every
    /// cycle also carries ENF and SIR, so that a flag set during the
    /// cycle is latched and the card's interrupt and service requests
    /// are brought up to date.  An I/O instruction addressed to an
    /// empty slot reads zero and does nothing else.
    pub fn io(
        &mut self,
        ctx: &Context,
        select_code: SelectCode,
        inbound: InboundSignals,
        data: u16,
    ) -> Result<SignalsValue, Stop> {
        let signals = inbound | self.housekeeping_signals();
        match self.cards.get_mut(&select_code) {
            None => {
                event!(
                    Level::WARN,
                    "I/O cycle {:?} addressed to empty select code {}",
                    inbound,
                    select_code
                );
                Ok(SignalsValue::default())
            }
            Some(card) => {
                let result = card.io(ctx, signals, data)?;
                self.requests.insert(select_code, result.signals);
                Ok(result)
            }
        }
    }

    /// Sends PRESET (PON, POPIO and CRS) to every card.
    pub fn preset(&mut self, ctx: &Context) -> Result<(), Stop> {
        let signals = InboundSignals::PON | InboundSignals::POPIO | InboundSignals::CRS;
        let select_codes: Vec<SelectCode> = self.cards.keys().copied().collect();
        for sc in select_codes {
            self.io(ctx, sc, signals, 0)?;
        }
        Ok(())
    }

    /// Performs the device activity of every card which has an event
    /// due at or before `ctx.simulated_time`.
    pub fn service(&mut self, ctx: &Context) -> Result<(), Stop> {
        let due: Vec<SelectCode> = self
            .cards
            .iter()
            .filter(|(_, card)| matches!(card.next_event_due(), Some(t) if t <= ctx.simulated_time))
            .map(|(sc, _)| *sc)
            .collect();
        for sc in due {
            let span = span!(Level::ERROR, "service", select_code=%sc);
            let _enter = span.enter();
            if let Some(card) = self.cards.get_mut(&sc) {
                card.service(ctx)?;
            }
            // Pick up any change in the card's requests.
            self.io(ctx, sc, InboundSignals::empty(), 0)?;
        }
        Ok(())
    }

    /// Returns the earliest time at which some card needs servicing.
    pub fn next_event_due(&self) -> Option<Duration> {
        self.cards
            .values()
            .filter_map(|card| card.next_event_due())
            .min()
    }

    /// Walks the interrupt priority chain from the highest-priority
    /// (lowest select code) card and returns the select code of the
    /// card which interrupts, if any.  A card which does not pass PRL
    /// blocks every card below it.
    pub fn interrupt_request(&mut self, ctx: &Context) -> Result<Option<SelectCode>, Stop> {
        if !self.interrupt_system {
            return Ok(None);
        }
        let select_codes: Vec<SelectCode> = self.cards.keys().copied().collect();
        for sc in select_codes {
            let result = self.io(ctx, sc, InboundSignals::PRH, 0)?;
            if result.signals.contains(OutboundSignals::IRQ) {
                event!(Level::DEBUG, "interrupt request from select code {}", sc);
                return Ok(Some(sc));
            }
            if !result.signals.contains(OutboundSignals::PRL) {
                event!(
                    Level::TRACE,
                    "priority chain is held by select code {}",
                    sc
                );
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Acknowledges an interrupt from the card at `select_code`.
    pub fn acknowledge(&mut self, ctx: &Context, select_code: SelectCode) -> Result<(), Stop> {
        self.io(ctx, select_code, InboundSignals::IAK, 0).map(|_| ())
    }

    /// Returns true if the card at `select_code` is requesting a DMA
    /// (DCPC) transfer.
    pub fn dma_request(&self, select_code: SelectCode) -> bool {
        self.requests
            .get(&select_code)
            .is_some_and(|signals| signals.contains(OutboundSignals::SRQ))
    }
}
