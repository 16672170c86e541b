//! Time sources used by the rank list and by tests.

mod clock;

pub use clock::{TimeSource, VirtualClock, WallClock};
