use std::any::Any;
use std::time::Duration;

use base::prelude::*;

use super::*;

/// A minimal card: a data register plus the standard flip-flops.
/// Output sets the flag, as a "device done" would.
#[derive(Debug, Default)]
struct RegisterCard {
    flags: StandardFlags,
    register: u16,
}

impl IoCard for RegisterCard {
    fn name(&self) -> String {
        "REG".to_string()
    }

    fn io(
        &mut self,
        _ctx: &Context,
        inbound: InboundSignals,
        data: u16,
    ) -> Result<SignalsValue, Stop> {
        dispatch(inbound, |signal, out| {
            match signal {
                InboundSignal::Ioi => out.value = self.register,
                InboundSignal::Ioo => {
                    self.register = data;
                    self.flags.flag_buffer = true;
                }
                InboundSignal::Pon => self.register = 0,
                _ => (),
            }
            self.flags.handle(signal, inbound, out);
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn ctx() -> Context {
    Context::new(Duration::ZERO, Duration::ZERO)
}

#[test]
fn test_skip_then_clear_flag() {
    let ctx = ctx();
    let mut card = RegisterCard::default();
    card.flags.flag = true;
    card.flags.flag_buffer = true;
    // SFS,C: the skip sees the flag before CLF clears it.
    let result = card
        .io(&ctx, InboundSignals::SFS | InboundSignals::CLF, 0)
        .expect("no stop");
    assert!(result.signals.contains(OutboundSignals::SKF));
    assert!(!card.flags.flag);
    let result = card.io(&ctx, InboundSignals::SFS, 0).expect("no stop");
    assert!(!result.signals.contains(OutboundSignals::SKF));
}

#[test]
fn test_flag_buffer_latches_on_enable_flag() {
    let ctx = ctx();
    let mut card = RegisterCard::default();
    card.io(&ctx, InboundSignals::STF, 0).expect("no stop");
    assert!(card.flags.flag_buffer);
    assert!(!card.flags.flag);
    card.io(&ctx, InboundSignals::ENF, 0).expect("no stop");
    assert!(card.flags.flag);
}

#[test]
fn test_output_and_input() {
    let ctx = ctx();
    let mut bp = Backplane::new();
    let sc = select_code!(0o12);
    bp.attach(sc, Box::new(RegisterCard::default()));
    bp.io(&ctx, sc, InboundSignals::IOO, 0o123456).expect("no stop");
    let result = bp.io(&ctx, sc, InboundSignals::IOI, 0).expect("no stop");
    assert_eq!(result.value, 0o123456);
    // The output set the flag buffer, and the backplane's ENF latched it.
    let result = bp.io(&ctx, sc, InboundSignals::SFS, 0).expect("no stop");
    assert!(result.signals.contains(OutboundSignals::SKF));
    let card: &RegisterCard = bp.card_as(sc).expect("card should be present");
    assert!(card.flags.flag);
}

#[test]
fn test_empty_slot_reads_zero() {
    let ctx = ctx();
    let mut bp = Backplane::new();
    let result = bp
        .io(&ctx, select_code!(0o30), InboundSignals::IOI | InboundSignals::SFS, 0)
        .expect("no stop");
    assert_eq!(result, SignalsValue::default());
}

fn interrupting_card() -> Box<RegisterCard> {
    Box::new(RegisterCard {
        flags: StandardFlags {
            control: true,
            flag: true,
            flag_buffer: true,
        },
        register: 0,
    })
}

#[test]
fn test_lowest_select_code_wins() {
    let ctx = ctx();
    let mut bp = Backplane::new();
    bp.attach(select_code!(0o21), interrupting_card());
    bp.attach(select_code!(0o14), interrupting_card());
    bp.attach(select_code!(0o10), Box::new(RegisterCard::default()));
    assert_eq!(bp.interrupt_request(&ctx).expect("no stop"), None);
    bp.set_interrupt_system(true);
    assert_eq!(
        bp.interrupt_request(&ctx).expect("no stop"),
        Some(select_code!(0o14))
    );
}

#[test]
fn test_acknowledged_card_holds_priority_until_flag_cleared() {
    let ctx = ctx();
    let mut bp = Backplane::new();
    bp.set_interrupt_system(true);
    bp.attach(select_code!(0o14), interrupting_card());
    bp.attach(select_code!(0o21), interrupting_card());
    bp.acknowledge(&ctx, select_code!(0o14)).expect("no stop");
    // The acknowledged card no longer requests an interrupt, but it
    // still holds PRL low, so the lower-priority card is blocked.
    assert_eq!(bp.interrupt_request(&ctx).expect("no stop"), None);
    bp.io(&ctx, select_code!(0o14), InboundSignals::CLF, 0)
        .expect("no stop");
    assert_eq!(
        bp.interrupt_request(&ctx).expect("no stop"),
        Some(select_code!(0o21))
    );
}

#[test]
fn test_priority_resolution_without_interrupt_enable() {
    let mut out = SignalsValue::default();
    out.signals = OutboundSignals::CN_VALID | OutboundSignals::CN_IRQ;
    resolve_priority(InboundSignals::PRH, &mut out);
    assert!(!out.signals.contains(OutboundSignals::IRQ));
    assert!(out.signals.contains(OutboundSignals::PRL));
}
