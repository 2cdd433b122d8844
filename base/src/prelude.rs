//! The prelude exports the types which are useful in describing the
//! HP 2100 I/O system.  Providing this prelude is the main purpose of
//! the base crate.
pub use super::error::*;
pub use super::signal::{InboundSignal, InboundSignals, OutboundSignals, SignalsValue};
pub use super::types::*;
pub use super::{bus_address, select_code};
