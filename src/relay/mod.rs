//! The session-and-channel fan-out engine
//!
//! One [`RelayServer`] per node owns the live [`Session`]s and [`Channel`]s.
//! Channels bridge local sessions to their bus topic; the server consumes a
//! reserved main topic for presence and cross-node control.

pub mod channel;
pub mod message;
pub mod server;
pub mod session;

pub use channel::Channel;
pub use message::{Action, Message, MessageType, Participant, Status};
pub use server::RelayServer;
pub use session::{EnqueueError, Session};

use std::time::Duration;

/// Reserved bus topic for presence and cross-node control envelopes.
pub const MAIN_TOPIC: &str = "main-channel";

/// Largest accepted client frame.
pub const MAX_FRAME_BYTES: usize = 10_000;

/// Bounded outbound queue per session.
pub const OUTBOUND_QUEUE_FRAMES: usize = 256;

/// Read deadline; refreshed whenever the peer answers a ping.
pub const PONG_INTERVAL: Duration = Duration::from_secs(60);

/// Ping period: 0.9 × the pong interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(54);

/// Deadline for any single socket write.
pub const WRITE_DELAY: Duration = Duration::from_secs(10);

/// Poll period while waiting for the server to finish registering a session
/// whose socket died early.
pub const REGISTRATION_POLL: Duration = Duration::from_millis(5);

/// Close reason sent on server-initiated teardown.
pub const CLOSE_REASON: &str = "Server closed session.";
