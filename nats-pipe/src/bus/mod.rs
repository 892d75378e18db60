//! Bus abstraction and implementations.

mod memory;
mod nats;
mod traits;

pub use memory::{MemoryBus, DEFAULT_MAX_PAYLOAD};
pub use nats::NatsBus;
pub use traits::{Bus, BusError, PendingLimits, Subscription};
