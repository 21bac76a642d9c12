//! Pieces shared by every outlane crate: logging setup, the logging macros
//! used throughout the engine, and the process-wide shutdown signal.

pub mod hostname;
pub mod logging;

pub use tracing;

/// Broadcast to every long running task when the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop taking new work and finish what is in flight.
    Shutdown,
    /// Everything has been wound down.
    Finalised,
}
