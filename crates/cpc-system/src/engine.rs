//! Request Engine + Reply Router: the sans-I/O core.
//!
//! `SystemEndpointCore` is synchronous, never suspends, and owns no
//! mutex or channel — callers are never blocked waiting on another
//! thread and there is nothing to deadlock on. It is
//! driven by exactly one external owner (see [`crate::driver::Driver`]),
//! which calls its `on_*` methods as events arrive and executes the
//! [`Action`]s it emits against the real link layer and real timers.
//! This split is the same shape `quinn-proto`/`rustls` use to keep a
//! protocol state machine testable without a runtime.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::command::{Callback, CommandHandle, CommandTable};
use crate::error::{fatal, Error};
use crate::link::{EndpointErrorReason, EndpointQuery, EndpointState, HostFlags, LinkEvent, RetryPolicy, WriteFlags};
use crate::wire::{
    decode_frame, decode_property_payload, encode_noop, encode_prop_get, encode_prop_set,
    encode_reset, CommandSeq, PropertyId, SeqCounter, SystemCommandId, SystemStatus,
};

/// Endpoint id this crate always operates on. Fixed by the protocol,
/// not a parameter.
pub const SYSTEM_ENDPOINT_ID: u8 = 0;

/// Retry policy for the `ENDPOINT_STATE_N` close-echo: 5 retries,
/// 100ms apart.
pub const ENDPOINT_STATE_ECHO_POLICY: RetryPolicy = RetryPolicy::new(5, std::time::Duration::from_millis(100));

/// Something the core needs the driver to do. The core never performs
/// I/O or timer manipulation itself; it queues actions here and the
/// driver drains them with [`SystemEndpointCore::drain_actions`] after
/// every call.
#[derive(Debug)]
pub enum Action {
    Write { bytes: Vec<u8>, flags: WriteFlags },
    ArmTimer { seq: CommandSeq, period: std::time::Duration },
    CancelTimer { seq: CommandSeq },
    FlushTransmitQueue,
    SetEndpointInError { endpoint_id: u8, reason: EndpointErrorReason },
    CloseEndpoint { force: bool, immediate: bool },
    OpenEndpoint,
}

/// Where a command sits in its submit/ack/retry/done lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Submitted,
    Acked,
    Retrying,
    Done,
}

/// The Request Engine + Reply Router, combined: in the C source these
/// are one compilation unit (`system.c`) sharing the same Command
/// Table, and splitting them into separate Rust types would only add
/// an artificial seam neither side of the split needs.
pub struct SystemEndpointCore {
    table: CommandTable,
    seq: SeqCounter,
    actions: VecDeque<Action>,
    states: std::collections::HashMap<CommandSeq, CommandState>,
    host_flags: HostFlags,
    last_status_observers: Vec<Box<dyn FnMut(SystemStatus) + Send>>,
}

impl SystemEndpointCore {
    pub fn new(host_flags: HostFlags) -> Self {
        Self {
            table: CommandTable::new(),
            seq: SeqCounter::default(),
            actions: VecDeque::new(),
            states: std::collections::HashMap::new(),
            host_flags,
            last_status_observers: Vec::new(),
        }
    }

    /// Drain every action queued since the last drain, in emission order.
    pub fn drain_actions(&mut self) -> impl Iterator<Item = Action> + '_ {
        self.actions.drain(..)
    }

    pub fn in_flight_count(&self) -> usize {
        self.table.len()
    }

    pub fn command_state(&self, seq: CommandSeq) -> Option<CommandState> {
        self.states.get(&seq).copied()
    }

    fn push(&mut self, action: Action) {
        self.actions.push_back(action);
    }

    /// Shared submission path for every command kind: build the handle
    /// for an already-allocated `seq`, push it onto the table, write the
    /// frame with `INFORMATION_POLL` set, and arm nothing yet — the
    /// timer is armed only once the poll is acknowledged.
    fn issue(
        &mut self,
        seq: CommandSeq,
        frame: Vec<u8>,
        callback: Callback,
        policy: RetryPolicy,
    ) -> Result<CommandSeq, Error> {
        if self.table.len() >= 256 {
            return Err(Error::CommandTableFull);
        }

        let handle = CommandHandle::new(seq, frame.clone(), callback, policy.max_retries, policy.period);
        self.table.push_back(handle);
        self.states.insert(seq, CommandState::Submitted);

        self.push(Action::Write {
            bytes: frame,
            flags: WriteFlags {
                information_poll: true,
                ..WriteFlags::default()
            },
        });

        trace!(%seq, "command submitted");
        Ok(seq)
    }

    pub fn noop(
        &mut self,
        policy: RetryPolicy,
        callback: impl FnOnce(CommandSeq, SystemStatus) + Send + 'static,
    ) -> Result<CommandSeq, Error> {
        let seq = self.next_seq_for_frame();
        self.issue(seq, encode_noop(seq), Callback::Noop(Box::new(callback)), policy)
    }

    pub fn reset(
        &mut self,
        policy: RetryPolicy,
        callback: impl FnOnce(CommandSeq, SystemStatus, SystemStatus) + Send + 'static,
    ) -> Result<CommandSeq, Error> {
        let seq = self.next_seq_for_frame();
        self.issue(seq, encode_reset(seq), Callback::Reset(Box::new(callback)), policy)
    }

    /// Alias for [`Self::reset`]; some callers prefer the name that
    /// matches what the SECONDARY actually does on receipt.
    pub fn reboot(
        &mut self,
        policy: RetryPolicy,
        callback: impl FnOnce(CommandSeq, SystemStatus, SystemStatus) + Send + 'static,
    ) -> Result<CommandSeq, Error> {
        self.reset(policy, callback)
    }

    pub fn property_get(
        &mut self,
        prop_id: PropertyId,
        policy: RetryPolicy,
        callback: impl FnOnce(CommandSeq, PropertyId, Vec<u8>, SystemStatus) + Send + 'static,
    ) -> Result<CommandSeq, Error> {
        let seq = self.next_seq_for_frame();
        self.issue(
            seq,
            encode_prop_get(seq, prop_id),
            Callback::Property(Box::new(callback)),
            policy,
        )
    }

    /// # Panics
    ///
    /// Panics (fatal) if `value` is empty.
    pub fn property_set(
        &mut self,
        prop_id: PropertyId,
        value: Vec<u8>,
        policy: RetryPolicy,
        callback: impl FnOnce(CommandSeq, PropertyId, Vec<u8>, SystemStatus) + Send + 'static,
    ) -> Result<CommandSeq, Error> {
        let seq = self.next_seq_for_frame();
        self.issue(
            seq,
            encode_prop_set(seq, prop_id, &value),
            Callback::Property(Box::new(callback)),
            policy,
        )
    }

    fn next_seq_for_frame(&mut self) -> CommandSeq {
        self.seq.next()
    }

    /// Register an observer for unsolicited `LAST_STATUS` notifications.
    /// Observers fire in registration order.
    pub fn register_unsolicited_last_status(&mut self, observer: impl FnMut(SystemStatus) + Send + 'static) {
        self.last_status_observers.push(Box::new(observer));
    }

    /// A poll for `seq` has been acknowledged. The poll-ack itself
    /// carries no status (it is a link-layer primitive, not a
    /// system-endpoint command); the branch is on the handle's own
    /// `error_status` instead. Arms a fresh timer if that's `Ok`; re-arms
    /// the existing timer (same period, full retry budget untouched) if
    /// it's `InProgress`; warns and ignores anything else.
    pub fn on_poll_acknowledged(&mut self, seq: CommandSeq) {
        let Some(handle) = self.table.find_by_seq(seq) else {
            warn!(%seq, "poll acknowledged for unknown command, ignoring");
            return;
        };
        let period = handle.retry_period;
        let error_status = handle.error_status;

        match error_status {
            SystemStatus::Ok => {
                self.states.insert(seq, CommandState::Acked);
                self.push(Action::ArmTimer { seq, period });
            }
            SystemStatus::InProgress => {
                self.push(Action::ArmTimer { seq, period });
            }
            other => {
                warn!(%seq, ?other, "poll acknowledged with unexpected status, ignoring");
            }
        }
    }

    /// The per-command timer for `seq` fired. Decrements the retry
    /// budget; if any remain, retransmits and re-arms; otherwise the
    /// command times out and its callback is invoked with `Timeout`
    /// status, mirroring `on_timer_expired`/`sl_cpc_system_cmd_timed_out`.
    pub fn on_timer_fire(&mut self, seq: CommandSeq) {
        let Some(handle) = self.table.find_by_seq_mut(seq) else {
            warn!(%seq, "timer fired for unknown command, ignoring");
            return;
        };

        if handle.retries_remaining == 0 {
            self.timeout(seq);
            return;
        }

        handle.retries_remaining -= 1;
        handle.error_status = SystemStatus::InProgress;
        let frame = handle.frame.clone();
        let period = handle.retry_period;

        self.states.insert(seq, CommandState::Retrying);
        self.table.move_to_back(seq);

        debug!(%seq, retries_remaining = handle.retries_remaining, "retrying command");
        self.push(Action::Write {
            bytes: frame,
            flags: WriteFlags {
                information_poll: true,
                ..WriteFlags::default()
            },
        });
        self.push(Action::ArmTimer { seq, period });
    }

    fn timeout(&mut self, seq: CommandSeq) {
        let Some(handle) = self.table.remove(seq) else {
            return;
        };
        self.states.insert(seq, CommandState::Done);
        warn!(%seq, "command timed out");
        // `error_status` is `Timeout` for every command kind; a timed-out
        // RESET additionally reports `reset_status = Failure` (the
        // dedicated reset-result slot `dispatch_callback`'s
        // `secondary_status` feeds into `Callback::Reset` — ignored by
        // `Noop`/`Property`, so it's safe to always pass `Failure` here).
        dispatch_callback(handle.callback, seq, PropertyId(0), Vec::new(), SystemStatus::Timeout, SystemStatus::Failure);
    }

    /// A solicited final arrived. Cancels the command's timer, removes
    /// it from the table, and dispatches its callback. `RESET` finals
    /// additionally clear `ignore_reset_reason`. A final for a `seq` no
    /// longer (or never) in the table is a stale/duplicate final, not a
    /// protocol violation on its own — it is warned and dropped, same as
    /// a stale poll-ACK (see [`Self::on_poll_acknowledged`]).
    pub fn on_final(&mut self, bytes: &[u8]) {
        let frame = decode_frame(bytes);
        let Some(command_id) = SystemCommandId::from_wire(frame.command_id) else {
            fatal!("final arrived with unknown command id {:#04x}", frame.command_id);
        };

        let Some(handle) = self.table.remove(frame.seq) else {
            warn!(seq = %frame.seq, "final arrived for unknown/already-resolved command, ignoring");
            return;
        };

        self.states.insert(frame.seq, CommandState::Done);
        self.push(Action::CancelTimer { seq: frame.seq });

        let error_status = handle.error_status;

        match command_id {
            SystemCommandId::Reset => {
                self.host_flags.ignore_reset_reason.store(false, Ordering::Release);
                let reset_status = decode_reset_payload(frame.payload);
                dispatch_callback(handle.callback, frame.seq, PropertyId(0), Vec::new(), error_status, reset_status);
            }
            SystemCommandId::Noop => {
                dispatch_callback(handle.callback, frame.seq, PropertyId(0), Vec::new(), error_status, error_status);
            }
            SystemCommandId::PropertyIs => {
                let (prop_id, value) = decode_property_payload(frame.payload);
                dispatch_callback(handle.callback, frame.seq, prop_id, value.to_vec(), error_status, error_status);
            }
            SystemCommandId::PropertyGet | SystemCommandId::PropertySet => {
                fatal!("final arrived with request-only command id {:?}", command_id);
            }
        }
    }

    /// An unsolicited uframe arrived. `LAST_STATUS` fans out to every
    /// registered observer in registration order; `ENDPOINT_STATE_N`
    /// escalates the local endpoint to an error if anyone still listens
    /// to it, then always acknowledges the closure back to
    /// the SECONDARY with a `property_set(ENDPOINT_STATE_<id>, CLOSED)`
    /// at retries=5/period=100ms, regardless of the escalation outcome
    /// (see DESIGN.md for the reasoning).
    pub fn on_uframe(&mut self, bytes: &[u8], query: &dyn EndpointQuery) {
        let frame = decode_frame(bytes);
        let (prop_id, value) = decode_property_payload(frame.payload);

        if prop_id == PropertyId::LAST_STATUS {
            if value.len() != 4 {
                fatal!("LAST_STATUS uframe payload is {} bytes, expected 4", value.len());
            }
            let status = SystemStatus::from_wire(u32::from_le_bytes(value.try_into().unwrap()));
            for observer in &mut self.last_status_observers {
                observer(status);
            }
            return;
        }

        if let Some(endpoint_id) = prop_id.as_endpoint_id() {
            let has_listeners = !query.listener_list_empty(endpoint_id);
            let is_open = query.endpoint_state(endpoint_id) == EndpointState::Open;
            if has_listeners && is_open {
                debug!(endpoint_id, "endpoint torn down on SECONDARY while still open locally, escalating");
                self.push(Action::SetEndpointInError {
                    endpoint_id,
                    reason: EndpointErrorReason::DestinationUnreachable,
                });
            }

            debug!(endpoint_id, "acknowledging ENDPOINT_STATE_N closure to peer");
            let seq = self.next_seq_for_frame();
            let closed = EndpointState::Closed.to_wire().to_le_bytes();
            if let Err(err) = self.issue(
                seq,
                encode_prop_set(seq, prop_id, &closed),
                Callback::Property(Box::new(move |_, _, _, status| {
                    if status != SystemStatus::Ok {
                        warn!(endpoint_id, ?status, "endpoint state echo did not complete cleanly");
                    }
                })),
                ENDPOINT_STATE_ECHO_POLICY,
            ) {
                warn!(endpoint_id, ?err, "could not issue ENDPOINT_STATE_N closure echo");
            }
            return;
        }

        fatal!("unsolicited uframe for unrecognized property id {:#010x}", prop_id.0);
    }

    /// Dispatch a single [`LinkEvent`] into the appropriate `on_*` method.
    /// `query` is only consulted for `Uframe` events; pass any
    /// [`EndpointQuery`] implementation for the other two variants.
    pub fn on_link_event(&mut self, event: LinkEvent, query: &dyn EndpointQuery) {
        match event {
            LinkEvent::PollAcknowledged { seq } => self.on_poll_acknowledged(seq),
            LinkEvent::Final(bytes) => self.on_final(&bytes),
            LinkEvent::Uframe(bytes) => self.on_uframe(&bytes, query),
        }
    }

    /// Tear down the system endpoint: write the `UNNUMBERED_RESET_COMMAND`
    /// link-layer resequence primitive (an empty, flag-only write — not a
    /// system-frame-encoded `RESET` command), flush the transmit queue,
    /// drain and discard every in-flight command (their frame buffers are
    /// dropped and callbacks are *not* invoked — the C source frees the
    /// handles without calling back either), then close and reopen the
    /// endpoint.
    pub fn reset_system_endpoint(&mut self) {
        self.push(Action::Write {
            bytes: Vec::new(),
            flags: WriteFlags {
                unnumbered_reset_command: true,
                ..WriteFlags::default()
            },
        });
        self.push(Action::FlushTransmitQueue);

        for handle in self.table.drain() {
            self.push(Action::CancelTimer { seq: handle.seq });
        }
        self.states.clear();

        self.push(Action::CloseEndpoint { force: false, immediate: true });
        self.push(Action::OpenEndpoint);
    }
}

fn decode_reset_payload(payload: &[u8]) -> SystemStatus {
    if payload.len() != 4 {
        fatal!("RESET final payload is {} bytes, expected 4", payload.len());
    }
    SystemStatus::from_wire(u32::from_le_bytes(payload.try_into().unwrap()))
}

fn dispatch_callback(
    callback: Callback,
    seq: CommandSeq,
    prop_id: PropertyId,
    value: Vec<u8>,
    error_status: SystemStatus,
    secondary_status: SystemStatus,
) {
    match callback {
        Callback::Noop(cb) => cb(seq, error_status),
        Callback::Reset(cb) => cb(seq, error_status, secondary_status),
        Callback::Property(cb) => cb(seq, prop_id, value, error_status),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    fn core() -> SystemEndpointCore {
        SystemEndpointCore::new(HostFlags::new(false))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(100))
    }

    fn take_actions(core: &mut SystemEndpointCore) -> Vec<Action> {
        core.drain_actions().collect()
    }

    /// A fixed-answer [`EndpointQuery`] for unit tests that don't care
    /// about the escalation path (LAST_STATUS tests, the fatal-property
    /// test). Reports every endpoint closed with no listeners so the
    /// escalation branch in `on_uframe` never fires.
    struct NoListeners;
    impl EndpointQuery for NoListeners {
        fn listener_list_empty(&self, _endpoint_id: u8) -> bool {
            true
        }
        fn endpoint_state(&self, _endpoint_id: u8) -> EndpointState {
            EndpointState::Closed
        }
    }

    struct FixedQuery {
        listeners_empty: bool,
        state: EndpointState,
    }
    impl EndpointQuery for FixedQuery {
        fn listener_list_empty(&self, _endpoint_id: u8) -> bool {
            self.listeners_empty
        }
        fn endpoint_state(&self, _endpoint_id: u8) -> EndpointState {
            self.state
        }
    }

    /// Scenario 1: NOOP happy path.
    #[test]
    fn noop_happy_path() {
        let mut c = core();
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();

        let seq = c.noop(policy(), move |_, status| *result2.lock().unwrap() = Some(status)).unwrap();
        let actions = take_actions(&mut c);
        assert!(matches!(&actions[0], Action::Write { flags, .. } if flags.information_poll));
        assert_eq!(c.command_state(seq), Some(CommandState::Submitted));

        c.on_poll_acknowledged(seq);
        let actions = take_actions(&mut c);
        assert!(matches!(actions[0], Action::ArmTimer { seq: s, .. } if s == seq));
        assert_eq!(c.command_state(seq), Some(CommandState::Acked));

        let final_bytes = encode_noop(seq);
        c.on_final(&final_bytes);
        assert_eq!(*result.lock().unwrap(), Some(SystemStatus::Ok));
        assert_eq!(c.in_flight_count(), 0);
    }

    /// Scenario 2: one retry, then success.
    #[test]
    fn noop_one_retry_then_success() {
        let mut c = core();
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        let seq = c.noop(policy(), move |_, status| *result2.lock().unwrap() = Some(status)).unwrap();
        take_actions(&mut c);

        c.on_poll_acknowledged(seq);
        take_actions(&mut c);

        c.on_timer_fire(seq);
        let actions = take_actions(&mut c);
        assert!(matches!(&actions[0], Action::Write { .. }));
        assert!(matches!(&actions[1], Action::ArmTimer { .. }));

        c.on_final(&encode_noop(seq));
        assert_eq!(*result.lock().unwrap(), Some(SystemStatus::InProgress));
    }

    /// Scenario 3: timeout after exhausting retries.
    #[test]
    fn noop_timeout() {
        let mut c = core();
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        let seq = c
            .noop(RetryPolicy::new(1, Duration::from_millis(50)), move |_, status| {
                *result2.lock().unwrap() = Some(status)
            })
            .unwrap();
        take_actions(&mut c);
        c.on_poll_acknowledged(seq);
        take_actions(&mut c);

        c.on_timer_fire(seq); // consumes last retry
        take_actions(&mut c);
        c.on_timer_fire(seq); // retries_remaining was 0: timeout
        assert_eq!(*result.lock().unwrap(), Some(SystemStatus::Timeout));
        assert_eq!(c.in_flight_count(), 0);
    }

    /// Scenario 4: PROP_VALUE_GET round trip.
    #[test]
    fn property_get_round_trip() {
        let mut c = core();
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        let seq = c
            .property_get(PropertyId(0x0B), policy(), move |_, prop, value, status| {
                *got2.lock().unwrap() = Some((prop, value, status))
            })
            .unwrap();
        take_actions(&mut c);
        c.on_poll_acknowledged(seq);
        take_actions(&mut c);

        let mut final_bytes = vec![SystemCommandId::WIRE_PROPERTY_IS, seq.0, 8];
        final_bytes.extend_from_slice(&0x0Bu32.to_le_bytes());
        final_bytes.extend_from_slice(&0x2Au32.to_le_bytes());
        c.on_final(&final_bytes);

        let (prop, value, status) = got.lock().unwrap().clone().unwrap();
        assert_eq!(prop, PropertyId(0x0B));
        assert_eq!(value, 0x2Au32.to_le_bytes());
        assert_eq!(status, SystemStatus::Ok);
    }

    /// Scenario 5: LAST_STATUS fan-out to multiple observers.
    #[test]
    fn last_status_fans_out_in_registration_order() {
        let mut c = core();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        c.register_unsolicited_last_status(move |status| o1.lock().unwrap().push(("first", status)));
        c.register_unsolicited_last_status(move |status| o2.lock().unwrap().push(("second", status)));

        let mut uframe = vec![SystemCommandId::WIRE_PROPERTY_IS, 0, 8];
        uframe.extend_from_slice(&0u32.to_le_bytes());
        uframe.extend_from_slice(&0x11u32.to_le_bytes());
        c.on_uframe(&uframe, &NoListeners);

        let order = order.lock().unwrap();
        assert_eq!(order[0].0, "first");
        assert_eq!(order[1].0, "second");
        assert_eq!(order[0].1, SystemStatus::from_wire(0x11));
    }

    /// Scenario 6: endpoint 5 OPEN with active listeners gets escalated
    /// to an error, and the closure is always acknowledged with a
    /// CLOSED-valued `PROP_VALUE_SET`, retries=5/period=100ms.
    #[test]
    fn endpoint_state_n_with_listeners_escalates_and_echoes_closed() {
        let mut c = core();
        let mut uframe = vec![SystemCommandId::WIRE_PROPERTY_IS, 0, 8];
        let prop = PropertyId::endpoint_state(5);
        uframe.extend_from_slice(&prop.0.to_le_bytes());
        uframe.extend_from_slice(&SystemStatus::Ok.to_wire().to_le_bytes());

        let query = FixedQuery {
            listeners_empty: false,
            state: EndpointState::Open,
        };
        c.on_uframe(&uframe, &query);
        let actions = take_actions(&mut c);

        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetEndpointInError { endpoint_id: 5, reason: EndpointErrorReason::DestinationUnreachable }
        )));

        let write = actions
            .iter()
            .find_map(|a| match a {
                Action::Write { bytes, flags } if flags.information_poll => Some(bytes),
                _ => None,
            })
            .expect("expected a Write action");
        let frame = decode_frame(write);
        assert_eq!(frame.command_id, SystemCommandId::WIRE_PROPERTY_SET);
        let (echoed_prop, value) = decode_property_payload(frame.payload);
        assert_eq!(echoed_prop, prop);
        assert_eq!(u32::from_le_bytes(value.try_into().unwrap()), EndpointState::Closed.to_wire());
    }

    /// A closed or listener-less endpoint still gets the CLOSED echo,
    /// but no error escalation.
    #[test]
    fn endpoint_state_n_without_listeners_echoes_without_escalating() {
        let mut c = core();
        let mut uframe = vec![SystemCommandId::WIRE_PROPERTY_IS, 0, 8];
        let prop = PropertyId::endpoint_state(5);
        uframe.extend_from_slice(&prop.0.to_le_bytes());
        uframe.extend_from_slice(&SystemStatus::Ok.to_wire().to_le_bytes());

        c.on_uframe(&uframe, &NoListeners);
        let actions = take_actions(&mut c);

        assert!(!actions.iter().any(|a| matches!(a, Action::SetEndpointInError { .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::Write { .. })));
    }

    #[test]
    fn reset_final_clears_ignore_reset_reason() {
        let flags = HostFlags::new(true);
        let mut c = SystemEndpointCore::new(flags.clone());
        let seq = c.reset(policy(), |_, _, _| {}).unwrap();
        take_actions(&mut c);
        c.on_poll_acknowledged(seq);
        take_actions(&mut c);

        let mut final_bytes = vec![SystemCommandId::WIRE_RESET, seq.0, 4];
        final_bytes.extend_from_slice(&SystemStatus::Ok.to_wire().to_le_bytes());
        c.on_final(&final_bytes);

        assert!(!flags.ignore_reset_reason.load(Ordering::Acquire));
    }

    #[test]
    fn reset_system_endpoint_drains_table_without_invoking_callbacks() {
        let mut c = core();
        let invoked = Arc::new(Mutex::new(false));
        let invoked2 = invoked.clone();
        c.noop(policy(), move |_, _| *invoked2.lock().unwrap() = true).unwrap();
        take_actions(&mut c);

        c.reset_system_endpoint();
        let actions = take_actions(&mut c);
        assert!(actions.iter().any(|a| matches!(a, Action::CloseEndpoint { .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::OpenEndpoint)));
        assert_eq!(c.in_flight_count(), 0);
        assert!(!*invoked.lock().unwrap());
    }

    /// `reset_system_endpoint` must write the `UNNUMBERED_RESET_COMMAND`
    /// link-layer primitive — an empty, flag-only write — not a
    /// system-frame-encoded RESET command, and must close with
    /// `force=false` (matching `system.c`'s
    /// `core_close_endpoint(SL_CPC_ENDPOINT_SYSTEM, false, true)`).
    #[test]
    fn reset_system_endpoint_writes_unnumbered_reset_command() {
        let mut c = core();
        c.reset_system_endpoint();
        let actions = take_actions(&mut c);

        let write = actions
            .iter()
            .find_map(|a| match a {
                Action::Write { bytes, flags } => Some((bytes, flags)),
                _ => None,
            })
            .expect("expected a Write action");
        assert!(write.0.is_empty(), "UNNUMBERED_RESET_COMMAND carries no payload");
        assert!(write.1.unnumbered_reset_command);
        assert!(!write.1.information_poll);

        let close = actions
            .iter()
            .find_map(|a| match a {
                Action::CloseEndpoint { force, immediate } => Some((*force, *immediate)),
                _ => None,
            })
            .expect("expected a CloseEndpoint action");
        assert_eq!(close, (false, true));
    }

    #[test]
    fn stale_final_for_unknown_seq_is_warned_and_dropped() {
        let mut c = core();
        // No command was ever issued with seq 42; this final must not panic.
        c.on_final(&encode_noop(CommandSeq(42)));
        assert_eq!(c.in_flight_count(), 0);
    }

    #[test]
    fn duplicate_final_after_resolution_is_warned_and_dropped() {
        let mut c = core();
        let seq = c.noop(policy(), |_, _| {}).unwrap();
        take_actions(&mut c);
        c.on_poll_acknowledged(seq);
        take_actions(&mut c);
        c.on_final(&encode_noop(seq));

        // A second, duplicate final for the same (now-resolved) seq must
        // be dropped, not panic.
        c.on_final(&encode_noop(seq));
    }

    #[test]
    #[should_panic(expected = "unrecognized property id")]
    fn uframe_with_unknown_property_is_fatal() {
        let mut c = core();
        let mut uframe = vec![SystemCommandId::WIRE_PROPERTY_IS, 0, 8];
        uframe.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        uframe.extend_from_slice(&0u32.to_le_bytes());
        c.on_uframe(&uframe, &NoListeners);
    }

    #[test]
    fn command_table_full_is_a_result_not_a_panic() {
        let mut c = core();
        for _ in 0..256 {
            c.noop(policy(), |_, _| {}).unwrap();
        }
        let err = c.noop(policy(), |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::CommandTableFull));
    }
}
