//! Small range-restricted integer types that name things on the
//! HP 2100 I/O system: the select code of an interface card, and the
//! HP-IB address of a device attached to a bus.
use std::fmt::{self, Display, Formatter, Octal};

use serde::Serialize;

use super::error::ConversionFailed;

/// Identifies an I/O card slot on the backplane.  Select codes below
/// 0o10 are reserved for the CPU's own internal devices, so an
/// interface card always has a select code in the range 0o10..=0o77.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SelectCode(u8);

impl SelectCode {
    pub const MIN: SelectCode = SelectCode(0o10);
    pub const MAX: SelectCode = SelectCode(0o77);

    // This will always fail at compile time, so no need to hide it.
    // It's pub so that it can be used in select_code!().
    pub const fn new<const N: u8>() -> SelectCode {
        struct Helper<const M: u8>;
        impl<const M: u8> Helper<M> {
            const SC: SelectCode = {
                if M < SelectCode::MIN.0 || M > SelectCode::MAX.0 {
                    panic!("select code is out of range")
                } else {
                    SelectCode(M)
                }
            };
        }
        Helper::<N>::SC
    }

    /// The interrupt priority of a card is determined by its select
    /// code: lower select codes have higher priority.
    pub const fn priority(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for SelectCode {
    type Error = ConversionFailed;

    fn try_from(n: u8) -> Result<SelectCode, ConversionFailed> {
        if n < SelectCode::MIN.0 {
            Err(ConversionFailed::TooSmall)
        } else if n > SelectCode::MAX.0 {
            Err(ConversionFailed::TooLarge)
        } else {
            Ok(SelectCode(n))
        }
    }
}

impl From<SelectCode> for u8 {
    fn from(sc: SelectCode) -> u8 {
        sc.0
    }
}

impl Display for SelectCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:02o}", self.0)
    }
}

impl Octal for SelectCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Octal::fmt(&self.0, f)
    }
}

/// The HP-IB address of a device on a disc interface bus.  The
/// interface keeps one bit per device in its acceptor, listener,
/// talker and poll-response maps, and a parallel poll response is one
/// of the eight data lines, so only addresses 0 to 7 are usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BusAddress(u8);

impl BusAddress {
    pub const ZERO: BusAddress = BusAddress(0);
    pub const MAX: BusAddress = BusAddress(7);

    pub const fn new<const N: u8>() -> BusAddress {
        struct Helper<const M: u8>;
        impl<const M: u8> Helper<M> {
            const A: BusAddress = {
                if M > BusAddress::MAX.0 {
                    panic!("bus address is out of range")
                } else {
                    BusAddress(M)
                }
            };
        }
        Helper::<N>::A
    }

    /// Returns the single bit that represents this address in a
    /// per-card unit bitmap.
    pub const fn bit(&self) -> u8 {
        1 << self.0
    }

    /// Returns the data line (as a byte with one bit set) that a
    /// device at this address drives during a parallel poll.  Address
    /// 0 responds on DIO8, the most significant bit.
    pub const fn poll_line(&self) -> u8 {
        0x80 >> self.0
    }

    /// Iterates over the addresses whose bits are set in `bitmap`,
    /// lowest address first.
    pub fn in_bitmap(bitmap: u8) -> impl Iterator<Item = BusAddress> {
        crate::signal::LowestFirst::new(u32::from(bitmap))
            .map(|bit| BusAddress(bit.trailing_zeros() as u8))
    }
}

impl TryFrom<u8> for BusAddress {
    type Error = ConversionFailed;

    fn try_from(n: u8) -> Result<BusAddress, ConversionFailed> {
        if n > BusAddress::MAX.0 {
            Err(ConversionFailed::TooLarge)
        } else {
            Ok(BusAddress(n))
        }
    }
}

impl From<BusAddress> for u8 {
    fn from(a: BusAddress) -> u8 {
        a.0
    }
}

impl From<BusAddress> for usize {
    fn from(a: BusAddress) -> usize {
        usize::from(a.0)
    }
}

impl Display for BusAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[test]
fn test_select_code_range() {
    assert_eq!(SelectCode::try_from(0o7), Err(ConversionFailed::TooSmall));
    assert_eq!(SelectCode::try_from(0o100), Err(ConversionFailed::TooLarge));
    assert_eq!(SelectCode::try_from(0o12), Ok(SelectCode::new::<0o12>()));
    assert_eq!(SelectCode::new::<0o12>().to_string(), "12");
}

#[test]
fn test_bus_address_bits() {
    let a = BusAddress::new::<2>();
    assert_eq!(a.bit(), 0b0000_0100);
    assert_eq!(a.poll_line(), 0b0010_0000);
    assert_eq!(BusAddress::ZERO.poll_line(), 0x80);
    assert_eq!(BusAddress::try_from(8), Err(ConversionFailed::TooLarge));
}

#[test]
fn test_bus_address_bitmap_iteration() {
    let found: Vec<u8> = BusAddress::in_bitmap(0b1010_0010).map(u8::from).collect();
    assert_eq!(found, vec![1, 5, 7]);
    assert_eq!(BusAddress::in_bitmap(0).count(), 0);
}
