//! The async Driver: owns the real `tokio` timers and the real
//! [`LinkLayer`] connection, drives [`SystemEndpointCore`], and
//! executes the [`Action`]s it emits.
//!
//! Grounded in the reactor shape used by ZMQ-backed request/response
//! clients elsewhere in the ecosystem: a single task owns the transport
//! and a pending-request map, routes inbound events to the request that
//! is waiting on them, and the public API is a cheaply-`Clone`-able
//! handle that only ever talks to that task over a channel. Here the
//! "pending request map" is the Command Table itself, already owned by
//! [`SystemEndpointCore`] — [`DriverHandle`] just adds the
//! oneshot-per-call plumbing a synchronous core doesn't need on its own.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::engine::{Action, SystemEndpointCore, SYSTEM_ENDPOINT_ID};
use crate::error::Error;
use crate::link::{EndpointQuery, EndpointState, HostFlags, LinkLayer, OpenFlags, RetryPolicy, ServerQuery, TimerSource};
use crate::wire::{CommandSeq, PropertyId, SystemStatus};

/// Bridges the Driver's owned [`LinkLayer`] and [`ServerQuery`] into the
/// single synchronous [`EndpointQuery`] the core needs to decide whether
/// an `ENDPOINT_STATE_N` notification should escalate to an endpoint
/// error. Built fresh per event since both halves are `&self`.
struct DriverEndpointQuery<'a, L, Q> {
    link: &'a L,
    server_query: &'a Q,
}

impl<L: LinkLayer, Q: ServerQuery> EndpointQuery for DriverEndpointQuery<'_, L, Q> {
    fn listener_list_empty(&self, endpoint_id: u8) -> bool {
        self.server_query.listener_list_empty(endpoint_id)
    }

    fn endpoint_state(&self, endpoint_id: u8) -> EndpointState {
        self.link.endpoint_state(endpoint_id)
    }
}

/// A [`TimerSource`] backed by real `tokio` timers. Each armed seq owns
/// one per-command monotonic single-shot timer, as a single spawned
/// sleep task; cancelling aborts it, and arming an already-armed seq
/// replaces it rather than stacking a second one. A raw `timerfd_read`
/// can coalesce multiple expirations into one read and needs an
/// expiration-count check to detect a missed tick; `tokio::time::sleep`
/// can't coalesce (it resolves exactly once per spawned task), so there
/// is no count to read and nothing to miss.
pub struct TokioTimerSource {
    fired: mpsc::UnboundedSender<CommandSeq>,
    handles: HashMap<CommandSeq, JoinHandle<()>>,
}

impl TokioTimerSource {
    fn new(fired: mpsc::UnboundedSender<CommandSeq>) -> Self {
        Self {
            fired,
            handles: HashMap::new(),
        }
    }
}

impl TimerSource for TokioTimerSource {
    fn arm(&mut self, seq: CommandSeq, period: Duration) {
        if let Some(old) = self.handles.remove(&seq) {
            old.abort();
        }
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let _ = fired.send(seq);
        });
        self.handles.insert(seq, handle);
    }

    fn cancel(&mut self, seq: CommandSeq) {
        if let Some(handle) = self.handles.remove(&seq) {
            handle.abort();
        }
    }
}

type NoopReply = oneshot::Sender<SystemStatus>;
type ResetReply = oneshot::Sender<(SystemStatus, SystemStatus)>;
type PropertyReply = oneshot::Sender<(PropertyId, Vec<u8>, SystemStatus)>;

/// A request sent from a [`DriverHandle`] to the [`Driver`] task that
/// owns the core.
enum Request {
    Noop { policy: RetryPolicy, reply: NoopReply },
    Reset { policy: RetryPolicy, reply: ResetReply },
    PropertyGet { prop_id: PropertyId, policy: RetryPolicy, reply: PropertyReply },
    PropertySet { prop_id: PropertyId, value: Vec<u8>, policy: RetryPolicy, reply: PropertyReply },
    RegisterLastStatusObserver(Box<dyn FnMut(SystemStatus) + Send>),
    ResetSystemEndpoint,
}

/// A cheaply-cloneable handle to a running [`Driver`]. The only way
/// anything outside the Driver's own task touches
/// [`SystemEndpointCore`] — every call is routed through the run loop
/// via `tx`, so the core is only ever touched from its own task.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl DriverHandle {
    async fn call<T>(&self, request: Request, reply: oneshot::Receiver<T>) -> Result<T, Error> {
        self.tx.send(request).map_err(|_| Error::DriverStopped)?;
        reply.await.map_err(|_| Error::DriverStopped)
    }

    pub async fn noop(&self, policy: RetryPolicy) -> Result<SystemStatus, Error> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Noop { policy, reply }, rx).await
    }

    pub async fn reset(&self, policy: RetryPolicy) -> Result<(SystemStatus, SystemStatus), Error> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Reset { policy, reply }, rx).await
    }

    /// Alias for [`Self::reset`].
    pub async fn reboot(&self, policy: RetryPolicy) -> Result<(SystemStatus, SystemStatus), Error> {
        self.reset(policy).await
    }

    pub async fn property_get(
        &self,
        prop_id: PropertyId,
        policy: RetryPolicy,
    ) -> Result<(PropertyId, Vec<u8>, SystemStatus), Error> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::PropertyGet { prop_id, policy, reply }, rx).await
    }

    pub async fn property_set(
        &self,
        prop_id: PropertyId,
        value: Vec<u8>,
        policy: RetryPolicy,
    ) -> Result<(PropertyId, Vec<u8>, SystemStatus), Error> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::PropertySet { prop_id, value, policy, reply }, rx).await
    }

    pub fn register_unsolicited_last_status(&self, observer: impl FnMut(SystemStatus) + Send + 'static) {
        let _ = self.tx.send(Request::RegisterLastStatusObserver(Box::new(observer)));
    }

    /// Fire-and-forget: tears down and reopens the system endpoint.
    /// There is no reply because the C source's equivalent
    /// (`sl_cpc_system_reset_system_endpoint`) doesn't have one either.
    pub fn reset_system_endpoint(&self) {
        let _ = self.tx.send(Request::ResetSystemEndpoint);
    }
}

/// Runs [`SystemEndpointCore`] against a real [`LinkLayer`] and real
/// timers. Owns both exclusively: the core itself never awaits; only
/// this loop does.
pub struct Driver<L: LinkLayer, Q: ServerQuery> {
    core: SystemEndpointCore,
    link: L,
    server_query: Q,
    timers: TokioTimerSource,
    timer_fired: mpsc::UnboundedReceiver<CommandSeq>,
    requests: mpsc::UnboundedReceiver<Request>,
}

impl<L: LinkLayer, Q: ServerQuery> Driver<L, Q> {
    /// Open endpoint 0 and construct a Driver plus the handle callers
    /// use to talk to it. Spawn [`Self::run`] to actually start serving.
    pub async fn open(mut link: L, server_query: Q, host_flags: HostFlags) -> Result<(Self, DriverHandle), L::Error> {
        link.open_endpoint(SYSTEM_ENDPOINT_ID, OpenFlags { uframe_enable: true }, 1)
            .await?;

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();

        let driver = Self {
            core: SystemEndpointCore::new(host_flags),
            link,
            server_query,
            timers: TokioTimerSource::new(timer_tx),
            timer_fired: timer_rx,
            requests: req_rx,
        };
        Ok((driver, DriverHandle { tx: req_tx }))
    }

    /// Run forever, servicing requests, link-layer events, and timer
    /// fires, executing whatever [`Action`]s each produces. Returns
    /// only if every [`DriverHandle`] has been dropped and the link
    /// layer's event stream has ended, or a write fails.
    pub async fn run(mut self) -> Result<(), L::Error> {
        loop {
            tokio::select! {
                event = self.link.recv_event() => {
                    let query = DriverEndpointQuery { link: &self.link, server_query: &self.server_query };
                    self.core.on_link_event(event, &query);
                    self.drain_actions().await?;
                }
                Some(seq) = self.timer_fired.recv() => {
                    self.core.on_timer_fire(seq);
                    self.drain_actions().await?;
                }
                request = self.requests.recv() => {
                    match request {
                        Some(request) => {
                            self.handle_request(request);
                            self.drain_actions().await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Noop { policy, reply } => {
                let _ = self.core.noop(policy, move |_, status| {
                    let _ = reply.send(status);
                });
            }
            Request::Reset { policy, reply } => {
                let _ = self.core.reset(policy, move |_, error_status, reset_status| {
                    let _ = reply.send((error_status, reset_status));
                });
            }
            Request::PropertyGet { prop_id, policy, reply } => {
                let _ = self.core.property_get(prop_id, policy, move |_, prop_id, value, status| {
                    let _ = reply.send((prop_id, value, status));
                });
            }
            Request::PropertySet { prop_id, value, policy, reply } => {
                let _ = self.core.property_set(prop_id, value, policy, move |_, prop_id, value, status| {
                    let _ = reply.send((prop_id, value, status));
                });
            }
            Request::RegisterLastStatusObserver(observer) => {
                self.core.register_unsolicited_last_status(observer);
            }
            Request::ResetSystemEndpoint => {
                self.core.reset_system_endpoint();
            }
        }
    }

    /// Execute and drain one batch of [`Action`]s emitted by the core.
    async fn drain_actions(&mut self) -> Result<(), L::Error> {
        let actions: Vec<Action> = self.core.drain_actions().collect();
        for action in actions {
            match action {
                Action::Write { bytes, flags } => {
                    self.link.write(SYSTEM_ENDPOINT_ID, &bytes, flags).await?;
                }
                Action::ArmTimer { seq, period } => self.timers.arm(seq, period),
                Action::CancelTimer { seq } => self.timers.cancel(seq),
                Action::FlushTransmitQueue => self.link.flush_transmit_queue().await,
                Action::SetEndpointInError { endpoint_id, reason } => {
                    self.link.set_endpoint_in_error(endpoint_id, reason);
                }
                Action::CloseEndpoint { force, immediate } => {
                    self.link.close_endpoint(SYSTEM_ENDPOINT_ID, force, immediate).await?;
                }
                Action::OpenEndpoint => {
                    self.link
                        .open_endpoint(SYSTEM_ENDPOINT_ID, OpenFlags { uframe_enable: true }, 1)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Whether any endpoint-0 listener would actually observe an
    /// unsolicited notification right now.
    pub fn has_listeners(&self) -> bool {
        !self.server_query.listener_list_empty(SYSTEM_ENDPOINT_ID)
    }
}

/// Liveness prober built on top of a [`DriverHandle`]: periodically
/// sends NOOP and publishes whether it completed, successfully, before
/// the next one was due. Not part of the wire protocol, just a
/// convenience for callers who want a `watch::Receiver<bool>` of
/// "is the co-processor still answering."
pub struct Heartbeat;

impl Heartbeat {
    pub fn spawn(handle: DriverHandle, interval: Duration, policy: RetryPolicy) -> tokio::sync::watch::Receiver<bool> {
        let (tx, rx) = tokio::sync::watch::channel(true);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match tokio::time::timeout(interval, handle.noop(policy)).await {
                    Ok(Ok(SystemStatus::Ok)) => {
                        let _ = tx.send(true);
                    }
                    Ok(Ok(status)) => {
                        warn!(?status, "heartbeat NOOP completed with non-OK status");
                        let _ = tx.send(false);
                    }
                    Ok(Err(_)) | Err(_) => {
                        warn!("heartbeat NOOP did not complete within one interval");
                        let _ = tx.send(false);
                    }
                }
            }
        });
        rx
    }
}
