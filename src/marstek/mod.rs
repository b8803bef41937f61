//! Marstek Venus local API client
//!
//! Talks JSON-RPC over UDP to a single battery. The [`DeviceSession`] polls it
//! on a fixed interval and exposes the latest [`StateSnapshot`]; mode changes
//! go through the same socket.

pub mod coordinator;
pub mod dispatcher;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{PollOutcome, PollPhase, PollSettings};
pub use dispatcher::CommandSettings;
pub use session::{DeviceSession, SessionSettings};
pub use snapshot::{ListenerId, SnapshotListener, SnapshotStore, StateSnapshot};
pub use transport::{Transport, UdpTransport};
pub use types::*;
