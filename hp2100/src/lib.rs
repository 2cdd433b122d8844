//! This crate simulates part of the HP 2100 I/O system: the backplane
//! signals which connect the CPU to its interface cards, the 12821A
//! HP-IB Disc Interface card, and the Amigo disc drives attached to
//! its bus.
#![crate_name = "hp2100"]

mod clock;
mod context;
mod event;
mod stop;

pub mod da;
pub mod di;
pub mod disclib;
pub mod driver;
pub mod hpib;
pub mod io;

pub use clock::{BasicClock, Clock};
pub use context::Context;
pub use da::{AmigoDisc, ConfigurationError, DiscConfiguration, DiscInterface, InterfaceReport};
pub use di::{CardConfiguration, DiCard};
pub use driver::{DriverError, HostDriver};
pub use io::{Backplane, IoCard, StandardFlags};
pub use stop::{Stop, StopKind};
