//! Fixed-capacity buffer pool shared by one I/O reader and one parser.
//!
//! Slots are preallocated once and cycled between a writable and a readable
//! partition. Producers borrow a writable slot, fill it with no lock held and
//! push it; consumers borrow the oldest readable slot, read it and hand it
//! back. Nothing is copied between the two sides.

mod config;
mod error;
mod queue;
mod slots;

pub use config::{DEFAULT_CAPACITY, DEFAULT_DROP_TIMEOUT_MS, OverflowPolicy, QueueConfig};
pub use error::QueueError;
pub use queue::{BufferQueue, QueueStats, ReadSlot, WriteSlot};
pub use slots::SlotId;
