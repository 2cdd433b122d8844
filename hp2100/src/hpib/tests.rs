use test_strategy::{proptest, Arbitrary};

use base::prelude::*;

use super::*;

#[test]
fn test_command_decoding() {
    assert_eq!(BusCommand::from(0x3F), BusCommand::Unlisten);
    assert_eq!(BusCommand::from(0x5F), BusCommand::Untalk);
    assert_eq!(BusCommand::from(0x22), BusCommand::Listen(2));
    assert_eq!(BusCommand::from(0x45), BusCommand::Talk(5));
    assert_eq!(BusCommand::from(0x68), BusCommand::Secondary(8));
    assert_eq!(BusCommand::from(0x04), BusCommand::Addressed(SDC));
    assert_eq!(BusCommand::from(0x14), BusCommand::Universal(DCL));
    // The parity bit is ignored.
    assert_eq!(BusCommand::from(0xBF), BusCommand::Unlisten);
    assert_eq!(BusCommand::from(0x68).to_string(), "SCG 08");
}

#[test]
fn test_assert_wins_over_deny() {
    let mut bus = Bus::default();
    assert_eq!(bus.merge(BusLines::ATN, BusLines::ATN), Some(BusLines::empty()));
    assert_eq!(bus.lines, BusLines::ATN);
    // No change is reported as such.
    assert_eq!(bus.merge(BusLines::ATN, BusLines::empty()), None);
    assert_eq!(
        bus.merge(BusLines::EOI, BusLines::ATN),
        Some(BusLines::ATN)
    );
    assert_eq!(bus.lines, BusLines::EOI);
}

#[test]
fn test_recipients() {
    let mut bus = Bus {
        acceptors: 0b0000_0111,
        ..Bus::default()
    };
    bus.listen(bus_address!(1));
    bus.talk(bus_address!(2));
    assert_eq!(bus.recipients(0x12), 0b0000_0010);
    bus.lines = BusLines::ATN;
    assert_eq!(bus.recipients(UNL), 0b0000_0111);
    assert_eq!(bus.recipients(SDC), 0b0000_0010);
}

#[test]
fn test_poll_byte() {
    let bus = Bus {
        acceptors: 0b0000_1011,
        poll_response: 0b0000_1001 | 0b0001_0000,
        ..Bus::default()
    };
    // Address 4 is not attached, so it does not respond.
    assert_eq!(bus.poll_byte(), 0b1001_0000);
}

#[test]
fn test_remove() {
    let mut bus = Bus {
        acceptors: 0b11,
        poll_response: 0b11,
        ..Bus::default()
    };
    bus.talk(bus_address!(1));
    bus.remove(bus_address!(1));
    assert_eq!(bus.acceptors, 0b01);
    assert_eq!(bus.talker, 0);
    assert_eq!(bus.poll_response, 0b01);
}

#[derive(Arbitrary, Debug, Clone, Copy)]
enum Addressing {
    Listen(#[strategy(0u8..8)] u8),
    Talk(#[strategy(0u8..8)] u8),
    Unlisten(#[strategy(0u8..8)] u8),
    Untalk(#[strategy(0u8..8)] u8),
    UnaddressAll,
}

#[proptest]
fn addressing_is_exclusive(operations: Vec<Addressing>) {
    let mut bus = Bus::default();
    for op in operations {
        match op {
            Addressing::Listen(a) => bus.listen(BusAddress::try_from(a).unwrap()),
            Addressing::Talk(a) => bus.talk(BusAddress::try_from(a).unwrap()),
            Addressing::Unlisten(a) => bus.unlisten(BusAddress::try_from(a).unwrap()),
            Addressing::Untalk(a) => bus.untalk(BusAddress::try_from(a).unwrap()),
            Addressing::UnaddressAll => bus.unaddress_all(),
        }
        assert!(bus.talker.count_ones() <= 1);
        assert_eq!(bus.talker & bus.listeners, 0);
    }
}
