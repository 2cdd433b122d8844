//! The `base` crate defines the HP 2100 I/O system value types which
//! are useful both in a simulator and in tools associated with it:
//! backplane signal sets, card select codes and HP-IB bus addresses.
//! A tool which only needs to talk about these things can depend on
//! the base crate without depending on the simulator library itself.

mod error;
mod types;

pub mod collections;
pub mod prelude;
pub mod signal;

#[macro_export]
macro_rules! select_code {
    ($n:expr) => {
        $crate::prelude::SelectCode::new::<{ $n }>()
    };
}

#[macro_export]
macro_rules! bus_address {
    ($n:expr) => {
        $crate::prelude::BusAddress::new::<{ $n }>()
    };
}

#[test]
fn test_select_code_macro() {
    use prelude::SelectCode;
    let m: SelectCode = select_code!(0o14);
    let n: SelectCode = SelectCode::try_from(0o14_u8).expect("test data should be in range");
    assert_eq!(m, n);
}

#[test]
fn test_bus_address_macro() {
    use prelude::BusAddress;
    let p: BusAddress = bus_address!(7);
    assert_eq!(p, BusAddress::MAX);
}
