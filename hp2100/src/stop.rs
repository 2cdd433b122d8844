//! Conditions which stop the simulation.
//!
//! Almost everything that can go wrong on the simulated I/O system
//! is reported to the simulated host the way the hardware would
//! report it (a status word, a DSJ value, a dropped byte).  The
//! conditions here are the exceptions: they indicate either a bug in
//! the simulator or a failure of the host machine, and there is no
//! sensible way to continue.
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;

use serde::Serialize;

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, Serialize)]
pub enum StopKind {
    /// A state machine was entered in a state (or with a command)
    /// for which it has no handler.  This is a simulator bug.
    Internal,
    /// Reading or writing the host file behind a disc image failed.
    HostIo,
}

impl Display for StopKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            StopKind::Internal => "internal error",
            StopKind::HostIo => "host I/O error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stop {
    pub kind: StopKind,
    /// The device which stopped the simulation, e.g. "DA unit 1".
    pub device: String,
    pub message: String,
}

impl Stop {
    pub fn internal<D: Into<String>, M: Into<String>>(device: D, message: M) -> Stop {
        Stop {
            kind: StopKind::Internal,
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn host_io<D: Into<String>>(device: D, operation: &str, e: &io::Error) -> Stop {
        Stop {
            kind: StopKind::HostIo,
            device: device.into(),
            message: format!("{operation} failed: {e}"),
        }
    }
}

impl Display for Stop {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}: {}: {}", self.device, self.kind, self.message)
    }
}

impl Error for Stop {}

#[test]
fn test_stop_display() {
    let stop = Stop::internal("DA unit 2", "service entered in state idle");
    assert_eq!(
        stop.to_string(),
        "DA unit 2: internal error: service entered in state idle"
    );
    let e = io::Error::new(io::ErrorKind::Other, "disk full");
    let stop = Stop::host_io("DA unit 0", "sector write", &e);
    assert_eq!(stop.kind, StopKind::HostIo);
    assert_eq!(
        stop.to_string(),
        "DA unit 0: host I/O error: sector write failed: disk full"
    );
}
