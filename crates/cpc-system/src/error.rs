//! Error types and the `fatal!` protocol-invariant macro.
//!
//! Timeout is not one of these: it is surfaced through the ordinary
//! final-arrival callback path as `SystemStatus::Timeout`, the same
//! channel a successful command resolves through, not as an `Err`. The
//! only caller-actionable `Result` from the sans-I/O core is the
//! optional Command Table collision guard (`CommandTableFull`).
//! Everything else the C source guards with `FATAL_ON` — a frame with
//! an impossible length, a callback invoked for a command that isn't in
//! the table, an unsolicited command id outside
//! {LAST_STATUS, ENDPOINT_STATE_N} — is a bug in one of the two peers,
//! not a condition a caller can recover from, and is reported the same
//! way here: log at error level, then panic.

/// Errors a caller of [`crate::engine::SystemEndpointCore`] can receive
/// back from a `Result`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The Command Table already holds 256 live commands (the maximum
    /// addressable by an 8-bit sequence number). Not present in the
    /// original C source, which has no equivalent check.
    #[error("command table is full (256 in-flight commands)")]
    CommandTableFull,

    /// The link layer rejected a write, open, or close.
    #[error("link layer error: {0}")]
    LinkLayer(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The [`crate::driver::Driver`] task backing a
    /// [`crate::driver::DriverHandle`] has stopped running.
    #[error("driver task is no longer running")]
    DriverStopped,
}

/// Log a protocol-invariant violation at error level, then panic.
///
/// Mirrors the C source's `FATAL_ON(condition)` macros: these guard
/// conditions that indicate a bug in this implementation or its peer,
/// never a recoverable runtime state. Not a `Result` and not
/// `debug_assert!` — the check runs in release builds too, same as the
/// C `FATAL_ON` does.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!("{message}");
        panic!("cpc-system: {message}");
    }};
}

pub(crate) use fatal;
