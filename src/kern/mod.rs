//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory
//! Only the time source survives here; the VM core reads it to age
//! discardable objects.

pub mod timer;

pub use timer::{Clock, ManualClock, Nanos};
