//! Virtual time on the simulated HP 2100.
//!
//! Nothing in the simulator waits for real time to pass.  Whoever
//! drives the simulation (the host driver, a test) charges the clock
//! for each I/O instruction it issues and, when the machine has
//! nothing to do, jumps the clock to the deadline of the next
//! scheduled device event.

use std::time::Duration;

pub trait Clock {
    /// The simulated time since the machine was powered on.
    fn now(&self) -> Duration;

    /// Charges the clock for `interval` of simulated work.
    ///
    /// ```
    /// use std::time::Duration;
    /// use hp2100::{BasicClock, Clock};
    ///
    /// let mut clock = BasicClock::new();
    /// // Two I/O instructions.
    /// clock.consume(&Duration::from_micros(2));
    /// clock.consume(&Duration::from_micros(2));
    /// assert_eq!(clock.now(), Duration::from_micros(4));
    /// ```
    fn consume(&mut self, interval: &Duration);

    /// Idles the machine until `deadline`.  A deadline which has
    /// already passed leaves the clock where it is.
    fn advance_to(&mut self, deadline: Duration) {
        let now = self.now();
        if let Some(idle) = deadline.checked_sub(now) {
            self.consume(&idle);
        }
    }
}

/// A clock which only moves when it is told to.
#[derive(Debug, Default)]
pub struct BasicClock {
    since_power_on: Duration,
}

impl BasicClock {
    pub fn new() -> BasicClock {
        BasicClock::default()
    }
}

impl Clock for BasicClock {
    fn now(&self) -> Duration {
        self.since_power_on
    }

    fn consume(&mut self, interval: &Duration) {
        self.since_power_on += *interval;
    }
}

#[test]
fn test_advance_never_goes_backwards() {
    let mut clock = BasicClock::new();
    clock.advance_to(Duration::from_micros(50));
    assert_eq!(clock.now(), Duration::from_micros(50));
    clock.advance_to(Duration::from_micros(20));
    assert_eq!(clock.now(), Duration::from_micros(50));
}
