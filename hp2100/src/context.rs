//! This module manages the context in which the simulator is
//! performing a single operation.
//!
//! In general, a function call into the simulator represents an
//! opportunity to perform an I/O instruction or to emulate a state
//! change for a peripheral.
//!
//! The simulator is most concerned with keeping track of how much
//! time would have elapsed for the HP 2100 system it is emulating.
//! This allows us to know, for example, when a disc seek would have
//! finished or when an interface clear pulse would have ended.  But
//! the caller also keeps track of the actual elapsed time.
//!
//! In order to avoid confusion between these related quantities of
//! the same type, we keep them together in a struct so that we can
//! give them very clear names.
use core::time::Duration;

#[derive(Debug, Clone)]
pub struct Context {
    pub simulated_time: Duration,
    pub real_elapsed_time: Duration,
}

impl Context {
    #[must_use]
    pub fn new(simulated_time: Duration, real_elapsed_time: Duration) -> Context {
        Context {
            simulated_time,
            real_elapsed_time,
        }
    }

    /// Returns the simulated time `delay` from now.
    #[must_use]
    pub fn after(&self, delay: Duration) -> Duration {
        self.simulated_time + delay
    }
}
