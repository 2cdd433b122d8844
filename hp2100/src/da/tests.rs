use std::time::Duration;

use test_strategy::{proptest, Arbitrary};

use super::*;
use crate::di::{ControlWord, StatusWord};
use crate::disclib::{Opcode, SECTOR_WORDS};
use crate::hpib::{LISTEN_BASE, SECONDARY_BASE, TALK_BASE, UNL, UNT};

const UNIT0: BusAddress = bus_address!(0);

/// Drives the bus directly on behalf of the controller, and reads what
/// the drives send through the card's input register.
struct Harness {
    iface: DiscInterface,
    now: Duration,
}

impl Harness {
    fn new() -> Harness {
        Harness {
            iface: DiscInterface::new(CardConfiguration::new(select_code!(0o14))),
            now: Duration::ZERO,
        }
    }

    fn with_image(words: &[u16]) -> Harness {
        let mut h = Harness::new();
        h.iface
            .attach(0, DiscImage::in_memory(words))
            .expect("unit 0 should attach");
        h
    }

    fn ctx(&self) -> Context {
        Context::new(self.now, Duration::ZERO)
    }

    fn io(&mut self, signals: InboundSignals, data: u16) -> SignalsValue {
        let ctx = self.ctx();
        self.iface
            .io(&ctx, signals, data)
            .expect("the card should not stop the simulation")
    }

    fn lines(&mut self, assert: BusLines, deny: BusLines) {
        let ctx = self.ctx();
        let DiscInterface { card, disc } = &mut self.iface;
        card.bus_control(disc, &ctx, Originator::Controller, assert, deny)
            .expect("bus control should not stop");
    }

    fn source(&mut self, byte: u8) {
        let ctx = self.ctx();
        let DiscInterface { card, disc } = &mut self.iface;
        card.bus_source(disc, &ctx, Originator::Controller, byte)
            .expect("sourcing a byte should not stop");
    }

    /// Sends bytes with ATN asserted.  ATN is left asserted.
    fn command(&mut self, bytes: &[u8]) {
        self.lines(BusLines::ATN, BusLines::empty());
        for byte in bytes {
            self.source(*byte);
        }
    }

    fn data(&mut self, bytes: &[u8], eoi: bool) {
        self.lines(BusLines::empty(), BusLines::ATN);
        for (i, byte) in bytes.iter().enumerate() {
            if eoi && i + 1 == bytes.len() {
                self.lines(BusLines::EOI, BusLines::empty());
            }
            self.source(*byte);
        }
        self.lines(BusLines::empty(), BusLines::EOI);
    }

    /// Makes the card a listener, which also releases ATN.
    fn listen(&mut self) {
        self.io(InboundSignals::CLC, 0);
        self.io(
            InboundSignals::IOO,
            (ControlWord::CIC | ControlWord::LSTN).bits(),
        );
        self.io(InboundSignals::STC, 0);
    }

    fn drain(&mut self, received: &mut Vec<u16>) {
        while self.iface.card.status_word().contains(StatusWord::IRL) {
            received.push(self.io(InboundSignals::IOI, 0).value);
        }
    }

    /// Runs scheduled activity until there is none left, returning
    /// the words read from the card meanwhile.
    fn run(&mut self) -> Vec<u16> {
        let mut received = Vec::new();
        for _ in 0..10_000 {
            self.drain(&mut received);
            let Some(due) = self.iface.next_event_due() else {
                break;
            };
            self.now = self.now.max(due);
            let ctx = self.ctx();
            self.iface
                .service(&ctx)
                .expect("service should not stop the simulation");
        }
        self.drain(&mut received);
        received
    }

    fn state(&self) -> InterfaceState {
        self.iface.unit_state(0).expect("unit 0 exists")
    }

    fn status(&self) -> StatusCode {
        self.iface.report().units[0].status
    }

    fn polled(&self) -> bool {
        self.iface.card().bus().poll_response & UNIT0.bit() != 0
    }
}

const EOI_BIT: u16 = 0o1000;

#[test]
fn test_normal_read() {
    let sector: Vec<u16> = (0..SECTOR_WORDS as u16).map(|n| 0o100000 | n).collect();
    let mut h = Harness::with_image(&sector);

    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    assert_eq!(h.state(), InterfaceState::OpcodeWait);
    assert!(!h.polled());
    h.data(&[Opcode::Read as u8], false);
    assert_eq!(h.state(), InterfaceState::ParameterWait);
    h.data(&[0], true);
    assert_eq!(h.state(), InterfaceState::ReadWait);

    h.command(&[UNL, TALK_BASE, SECONDARY_BASE]);
    assert_eq!(h.state(), InterfaceState::ReadXfer);
    h.listen();
    let received = h.run();

    assert_eq!(received.len(), SECTOR_WORDS * 2);
    let (last, rest) = received.split_last().expect("data was received");
    assert_ne!(last & EOI_BIT, 0);
    assert!(rest.iter().all(|w| w & EOI_BIT == 0));
    let words: Vec<u16> = received
        .chunks_exact(2)
        .map(|pair| (pair[0] & 0xFF) << 8 | (pair[1] & 0xFF))
        .collect();
    assert_eq!(words, sector);

    assert_eq!(h.state(), InterfaceState::Idle);
    assert_eq!(h.iface.dsj(0), Some(0));
    assert!(h.polled());
    let report = &h.iface.report().units[0];
    assert_eq!((report.cylinder, report.head, report.sector), (0, 0, 1));
}

#[test]
fn test_aborted_write_sinks_data_until_eoi() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    h.data(&[Opcode::Write as u8, 0], true);
    assert_eq!(h.state(), InterfaceState::WriteWait);

    // The host asks for the wrong secondary.
    h.command(&[SECONDARY_BASE | 0x01]);
    assert_eq!(h.state(), InterfaceState::ErrorSink);
    assert_eq!(h.iface.dsj(0), Some(1));
    assert_eq!(h.status(), StatusCode::IoProgramError);

    h.data(&[1, 2], false);
    assert_eq!(h.state(), InterfaceState::ErrorSink);
    h.data(&[3], true);
    assert_eq!(h.state(), InterfaceState::Idle);
    assert!(h.polled());
}

#[test]
fn test_listen_secondary_in_read_wait_sources_error_byte() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    h.data(&[Opcode::Read as u8, 0], true);
    assert_eq!(h.state(), InterfaceState::ReadWait);

    // Write Data instead of Read Data.
    h.command(&[SECONDARY_BASE]);
    assert_eq!(h.state(), InterfaceState::ErrorSource);
    assert_eq!(h.iface.dsj(0), Some(1));
    assert_eq!(h.status(), StatusCode::IoProgramError);

    h.command(&[UNL, TALK_BASE]);
    h.listen();
    assert_eq!(h.run(), vec![EOI_BIT]);
    assert_eq!(h.state(), InterfaceState::Idle);
    assert!(h.polled());
}

#[test]
fn test_talk_secondary_in_write_wait_sinks_data() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    h.data(&[Opcode::Write as u8, 0], true);
    assert_eq!(h.state(), InterfaceState::WriteWait);

    // Read Data instead of Write Data.
    h.command(&[UNL, TALK_BASE, SECONDARY_BASE]);
    assert_eq!(h.state(), InterfaceState::ErrorSink);
    assert_eq!(h.iface.dsj(0), Some(1));
    assert_eq!(h.status(), StatusCode::IoProgramError);
    assert!(h.iface.disc.events.next_due().is_none());

    h.command(&[UNT, LISTEN_BASE]);
    h.data(&[1, 2], true);
    assert_eq!(h.state(), InterfaceState::Idle);
}

#[test]
fn test_untalk_abandons_status_before_it_is_sent() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    h.data(&[Opcode::RequestStatus as u8, 0], true);
    assert_eq!(h.state(), InterfaceState::StatusWait);
    h.command(&[UNL, TALK_BASE, SECONDARY_BASE | 0x08]);
    assert_eq!(h.state(), InterfaceState::CommandExec);

    h.command(&[UNT]);
    assert_eq!(h.state(), InterfaceState::Idle);
    assert!(!h.iface.disc.events.is_pending(0));
    assert!(h.polled());
    assert!(h.run().is_empty());

    // The next disc command starts normally.
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    assert_eq!(h.state(), InterfaceState::OpcodeWait);
}

#[test]
fn test_untalk_abandons_command_wait() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    h.data(&[Opcode::RequestStatus as u8, 0], true);
    h.command(&[UNL, TALK_BASE, SECONDARY_BASE | 0x08]);
    // Let the controller start the command.
    h.now = h.iface.next_event_due().expect("the command is scheduled");
    let ctx = h.ctx();
    h.iface.service(&ctx).expect("service should not stop");
    assert_eq!(h.state(), InterfaceState::CommandWait);

    h.command(&[UNT]);
    assert_eq!(h.state(), InterfaceState::Idle);
    assert!(!h.iface.disc.events.is_pending(0));
    assert!(h.run().is_empty());
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    assert_eq!(h.state(), InterfaceState::OpcodeWait);
}

#[test]
fn test_interface_clear_abandons_identify() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNT, UNL, SECONDARY_BASE | u8::from(UNIT0)]);
    assert_eq!(h.state(), InterfaceState::CommandExec);

    h.lines(BusLines::IFC, BusLines::empty());
    assert_eq!(h.state(), InterfaceState::Idle);
    assert!(!h.iface.disc.events.is_pending(0));
    h.lines(BusLines::empty(), BusLines::IFC);

    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    assert_eq!(h.state(), InterfaceState::OpcodeWait);
}

#[test]
fn test_interface_clear_abandons_seek() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    h.data(&[Opcode::Seek as u8, 0, 0, 10, 1, 2], true);
    assert_eq!(h.state(), InterfaceState::CommandExec);

    h.lines(BusLines::IFC, BusLines::empty());
    assert_eq!(h.state(), InterfaceState::Idle);
    assert!(h.polled());
    assert!(!h.iface.disc.events.is_pending(0));
}

#[test]
fn test_unlisten_ends_error_sink() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    h.data(&[Opcode::Write as u8, 0], true);
    h.command(&[SECONDARY_BASE | 0x02]);
    assert_eq!(h.state(), InterfaceState::ErrorSink);
    h.command(&[UNL]);
    assert_eq!(h.state(), InterfaceState::Idle);
}

#[test]
fn test_amigo_identify() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNT, UNL, SECONDARY_BASE | u8::from(UNIT0)]);
    assert_eq!(h.state(), InterfaceState::CommandExec);
    h.listen();
    assert_eq!(h.run(), vec![0x00, EOI_BIT | 0x03]);
    assert_eq!(h.state(), InterfaceState::Idle);
}

#[test]
fn test_unlisten_flushes_partial_sector() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    h.data(&[Opcode::Write as u8, 0], true);
    h.command(&[SECONDARY_BASE]);
    assert_eq!(h.state(), InterfaceState::WriteXfer);
    // The drive holds the host off until the sector buffer is ready.
    assert!(h.iface.card().lines().contains(BusLines::NRFD));
    h.run();
    assert!(!h.iface.card().lines().contains(BusLines::NRFD));

    h.data(&[0xAB, 0xCD, 0x12], false);
    h.command(&[UNL]);
    h.run();
    assert_eq!(h.state(), InterfaceState::Idle);
    assert_eq!(h.iface.dsj(0), Some(0));

    let sector = h.iface.disc.units[0]
        .drive
        .read_sector(0, 0, 0)
        .expect("in-memory read should succeed");
    assert_eq!(sector[..2], [0xABCD, 0x1200]);
    assert!(sector[2..].iter().all(|w| *w == 0));
}

#[test]
fn test_power_on_dsj_is_cleared_by_reading_it() {
    let mut h = Harness::with_image(&[]);
    h.io(InboundSignals::PON | InboundSignals::POPIO | InboundSignals::CRS, 0);
    assert_eq!(h.iface.dsj(0), Some(2));
    h.command(&[UNL, TALK_BASE, SECONDARY_BASE | 0x10]);
    h.listen();
    assert_eq!(h.run(), vec![EOI_BIT | 2]);
    assert_eq!(h.iface.dsj(0), Some(0));
}

#[test]
fn test_device_clear() {
    let mut h = Harness::with_image(&[]);
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x08]);
    h.data(&[Opcode::Read as u8], false);
    assert_eq!(h.state(), InterfaceState::ParameterWait);
    h.command(&[crate::hpib::DCL]);
    assert_eq!(h.state(), InterfaceState::CommandExec);
    h.run();
    assert_eq!(h.state(), InterfaceState::Idle);
    assert_eq!(h.iface.dsj(0), Some(0));
}

#[test]
fn test_loopback() {
    let mut h = Harness::with_image(&[]);
    let pattern: Vec<u8> = (1..=16).collect();
    h.command(&[UNL, LISTEN_BASE, SECONDARY_BASE | 0x1E]);
    h.run();
    assert_eq!(h.state(), InterfaceState::WriteXfer);
    h.data(&pattern, true);
    assert_eq!(h.state(), InterfaceState::Idle);

    h.command(&[UNL, TALK_BASE, SECONDARY_BASE | 0x1E]);
    h.listen();
    let received = h.run();
    let bytes: Vec<u8> = received.iter().map(|w| (w & 0xFF) as u8).collect();
    assert_eq!(bytes, pattern);
}

#[test]
fn test_unload_while_idle_reports_attention() {
    let mut h = Harness::with_image(&[]);
    h.iface.card.poll_response(UNIT0, false);
    h.iface.unload(0).expect("unit 0 is attached");
    assert_eq!(h.iface.dsj(0), Some(1));
    assert_eq!(h.status(), StatusCode::DriveAttention);
    assert!(h.polled());
    assert!(!h.iface.report().units[0].heads_loaded);
}

#[test]
fn test_configuration_errors() {
    let mut h = Harness::with_image(&[]);
    assert_eq!(
        h.iface.set_address(1, UNIT0),
        Err(ConfigurationError::DuplicateAddress {
            unit: 0,
            address: UNIT0
        })
    );
    assert_eq!(
        h.iface.set_model(0, DriveModel::Hp7906),
        Err(ConfigurationError::AlreadyAttached(0))
    );
    assert_eq!(
        h.iface.set_protect(UNITS, true),
        Err(ConfigurationError::NoSuchUnit(UNITS))
    );
    h.iface.detach(0).expect("unit 0 is attached");
    assert!(!h.iface.card().bus().is_acceptor(UNIT0));
    assert_eq!(
        h.iface.detach(0).map(|_| ()),
        Err(ConfigurationError::NotAttached(0))
    );
}

#[test]
fn test_moving_an_attached_unit() {
    let mut h = Harness::with_image(&[]);
    let new_address = bus_address!(5);
    h.iface
        .set_address(0, new_address)
        .expect("address 5 is free");
    assert!(!h.iface.card().bus().is_acceptor(UNIT0));
    assert!(h.iface.card().bus().is_acceptor(new_address));
    assert_ne!(h.iface.card().bus().poll_response & new_address.bit(), 0);
}

#[test]
fn test_service_in_idle_state_stops() {
    let mut h = Harness::with_image(&[]);
    h.iface.disc.events.activate(0, Duration::ZERO);
    let ctx = h.ctx();
    let stop = h
        .iface
        .service(&ctx)
        .expect_err("servicing an idle unit is a bug");
    assert_eq!(stop.kind, crate::stop::StopKind::Internal);
}

#[derive(Arbitrary, Debug, Clone, Copy)]
enum Addressing {
    Unaddressed,
    Listener,
    Talker,
}

#[proptest]
fn idle_unit_only_starts_commands(byte: u8, atn: bool, eoi: bool, addressing: Addressing) {
    let mut h = Harness::with_image(&[]);
    match addressing {
        Addressing::Unaddressed => (),
        Addressing::Listener => h.iface.card.listen(UNIT0),
        Addressing::Talker => h.iface.card.talk(UNIT0),
    }
    if atn {
        h.command(&[byte]);
    } else {
        h.data(&[byte], eoi);
    }
    let state = h.state();
    assert!(
        matches!(
            state,
            InterfaceState::Idle | InterfaceState::OpcodeWait | InterfaceState::CommandExec
        ),
        "byte {byte:#04x} moved an idle unit to {state}"
    );
}

#[derive(Arbitrary, Debug, Clone, Copy)]
enum Primary {
    Listen(#[strategy(0u8..8)] u8),
    Talk(#[strategy(0u8..8)] u8),
    Unlisten,
    Untalk,
}

#[proptest]
fn primary_commands_keep_addressing_exclusive(commands: Vec<Primary>) {
    let mut h = Harness::new();
    for unit in 0..UNITS {
        h.iface
            .attach(unit, DiscImage::in_memory(&[]))
            .expect("every unit should attach");
    }
    for command in commands {
        let byte = match command {
            Primary::Listen(a) => LISTEN_BASE | a,
            Primary::Talk(a) => TALK_BASE | a,
            Primary::Unlisten => UNL,
            Primary::Untalk => UNT,
        };
        h.command(&[byte]);
        let bus = h.iface.card().bus();
        assert!(bus.talker.count_ones() <= 1, "after {command:?}");
        assert_eq!(bus.talker & bus.listeners, 0, "after {command:?}");
        for unit in 0..UNITS {
            assert_eq!(h.iface.unit_state(unit), Some(InterfaceState::Idle));
        }
    }
}
