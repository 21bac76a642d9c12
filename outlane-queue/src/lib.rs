//! Queue authority model and protocol for the outlane delivery engine
//!
//! The engine checks deliveries out of an external queue and reports every
//! outcome back to it:
//! - `GET` a delivery for a zone (grants a lock token)
//! - `RELEASE` it once delivered
//! - `DEFER` it with a retry delay
//! - `BOUNCE` a terminal failure for notification
//!
//! The wire protocol is length-prefixed bincode over TCP.

pub mod authority;
pub mod client;
pub mod delivery;
pub mod error;
pub mod headers;
pub mod memory;
pub mod protocol;
pub mod server;

pub use authority::QueueAuthority;
pub use client::QueueClient;
pub use delivery::{Bounce, Delivery, DkimData, DkimKey, Lease, domain_of};
pub use error::{QueueError, Result};
pub use headers::{HeaderLine, Headers};
pub use memory::MemoryQueue;
pub use protocol::{Command, MAX_FRAME_SIZE, PROTOCOL_VERSION, Payload};
pub use server::QueueServer;
