//! External interfaces: the collaborators the core consumes
//! but doesn't own. Implemented once, for real, by [`crate::driver`];
//! implemented again, fake, by test fixtures.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::wire::CommandSeq;

/// Shared, externally-owned flags the core reads and occasionally
/// clears. `ignore_reset_reason` starts however the owner sets it and
/// is cleared (with `Release` ordering) by the core the moment a RESET
/// final arrives — see [`crate::engine::SystemEndpointCore::on_final`].
#[derive(Clone)]
pub struct HostFlags {
    pub ignore_reset_reason: Arc<AtomicBool>,
}

impl HostFlags {
    pub fn new(ignore_reset_reason: bool) -> Self {
        Self {
            ignore_reset_reason: Arc::new(AtomicBool::new(ignore_reset_reason)),
        }
    }
}

/// How many times to retransmit a command, and at what period. One
/// instance per call to `noop`/`reset`/`property_get`/`property_set`;
/// nothing in the core hands out a default, since the right retry
/// budget is a policy decision for the caller.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u8,
    pub period: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u8, period: Duration) -> Self {
        Self { max_retries, period }
    }
}

/// Flags passed to [`LinkLayer::open_endpoint`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub uframe_enable: bool,
}

/// Flags passed to [`LinkLayer::write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// INFORMATION_POLL: request a poll-ack/final handshake for this frame.
    pub information_poll: bool,
    /// UNNUMBERED_POLL: an unnumbered frame that still expects a poll-ack.
    pub unnumbered_poll: bool,
    /// UNNUMBERED_RESET_COMMAND: the link-layer resequence primitive used
    /// by [`crate::engine::SystemEndpointCore::reset_system_endpoint`].
    /// A flag-only signal with no system-frame payload, distinct from an
    /// ordinary system-endpoint `RESET` command.
    pub unnumbered_reset_command: bool,
}

/// Reason passed to [`LinkLayer::set_endpoint_in_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointErrorReason {
    /// The core gave up on endpoint 0 after exhausting retries on a
    /// command whose failure the link layer itself needs to know about.
    RetriesExhausted,
    /// An `ENDPOINT_STATE_N` uframe reported that endpoint `N` was torn
    /// down on the SECONDARY while the PRIMARY still had it open with
    /// active listeners.
    DestinationUnreachable,
}

/// The open/closed/error state of an endpoint, as reported back by the
/// link layer, and the wire encoding of that same tri-state used in
/// `ENDPOINT_STATE_N` property payloads. The wire layer doesn't pin
/// these values down (they only ever appear as an opaque 4-byte blob
/// the SECONDARY also writes); chosen to match the natural lifecycle
/// ordering open(0) -> closed(1) -> error(2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Open,
    Closed,
    Error,
}

impl EndpointState {
    const WIRE_OPEN: u32 = 0;
    const WIRE_CLOSED: u32 = 1;
    const WIRE_ERROR: u32 = 2;

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Open => Self::WIRE_OPEN,
            Self::Closed => Self::WIRE_CLOSED,
            Self::Error => Self::WIRE_ERROR,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            Self::WIRE_OPEN => Some(Self::Open),
            Self::WIRE_CLOSED => Some(Self::Closed),
            Self::WIRE_ERROR => Some(Self::Error),
            _ => None,
        }
    }
}

/// Synchronous queries the Reply Router needs to decide whether an
/// `ENDPOINT_STATE_N` notification should escalate to an
/// endpoint error: whether anyone on this host still listens to
/// `endpoint_id`, and what the link layer currently believes its state
/// is. Implemented once for real by [`crate::driver::Driver`] (delegating
/// to its [`LinkLayer`] and [`ServerQuery`]), and by test fixtures.
pub trait EndpointQuery {
    fn listener_list_empty(&self, endpoint_id: u8) -> bool;
    fn endpoint_state(&self, endpoint_id: u8) -> EndpointState;
}

/// An event arriving on endpoint 0 from the link layer: the three
/// things the core's `on_*` methods consume.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A poll has been acknowledged for `seq`. The poll-ack is a
    /// link-layer acknowledgement primitive, not a system-endpoint
    /// command — it carries no status of its own; the core decides how
    /// to arm the retry timer from the handle's own `error_status`
    /// (see [`crate::engine::SystemEndpointCore::on_poll_acknowledged`]).
    PollAcknowledged { seq: CommandSeq },
    /// A solicited final frame, still wire-encoded.
    Final(Vec<u8>),
    /// An unsolicited uframe, still wire-encoded.
    Uframe(Vec<u8>),
}

/// The link-layer (core) interface the system endpoint is built on top
/// of. One implementation (real: [`crate::driver::Driver`]'s inner
/// connection; fake: test fixtures).
///
/// Async because the real implementation talks to an external process
/// over a framed transport; the sans-I/O core in [`crate::engine`]
/// never calls these directly; it emits [`crate::engine::Action`]s for
/// [`crate::driver::Driver`] to execute against an implementation of
/// this trait.
pub trait LinkLayer: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn open_endpoint(
        &mut self,
        endpoint_id: u8,
        flags: OpenFlags,
        tx_window: u8,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn close_endpoint(
        &mut self,
        endpoint_id: u8,
        force: bool,
        immediate: bool,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn write(
        &mut self,
        endpoint_id: u8,
        bytes: &[u8],
        flags: WriteFlags,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn flush_transmit_queue(&mut self) -> impl Future<Output = ()> + Send;

    fn set_endpoint_in_error(&mut self, endpoint_id: u8, reason: EndpointErrorReason);

    fn endpoint_state(&self, endpoint_id: u8) -> EndpointState;

    /// Await the next event destined for endpoint 0.
    fn recv_event(&mut self) -> impl Future<Output = LinkEvent> + Send;
}

/// Queried by the Reply Router when an unsolicited `LAST_STATUS` or
/// `ENDPOINT_STATE_N` arrives, to decide whether anyone still cares.
pub trait ServerQuery: Send + 'static {
    /// True if no observer is registered for `endpoint_id` (server-side
    /// endpoint listener list is empty).
    fn listener_list_empty(&self, endpoint_id: u8) -> bool;
}

/// A single-shot, per-command timer source. [`crate::engine`] never
/// calls this directly either — it emits `Action::ArmTimer`/`CancelTimer`
/// for [`crate::driver::Driver`] to execute.
pub trait TimerSource: Send + 'static {
    fn arm(&mut self, seq: CommandSeq, period: Duration);
    fn cancel(&mut self, seq: CommandSeq);
}
