//! Leader Election Module
//!
//! Bully-style election over a fixed membership: the highest surviving
//! identifier wins. The synchronous [`ElectionEngine`] holds the state
//! machine; the [`ElectionCoordinator`] task drives it from detector events,
//! inbound announcements and the collection deadline.

mod coordinator;
mod engine;
mod round;

pub use coordinator::ElectionCoordinator;
pub use engine::{Announcement, ElectionEngine, ElectionPhase};
pub use round::{ElectionRound, RoundKey};
