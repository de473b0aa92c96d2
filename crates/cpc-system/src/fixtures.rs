//! Test doubles for the traits in [`crate::link`], recording every call
//! so integration tests can assert on what the Driver actually did.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::link::{EndpointErrorReason, EndpointState, LinkEvent, LinkLayer, OpenFlags, ServerQuery, WriteFlags};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Open { endpoint_id: u8, uframe_enable: bool },
    Close { endpoint_id: u8, force: bool, immediate: bool },
    Write { endpoint_id: u8, bytes: Vec<u8>, flags: WriteFlags },
    Flush,
    SetEndpointInError { endpoint_id: u8, reason: EndpointErrorReason },
}

#[derive(Debug, thiserror::Error)]
#[error("fake link layer error")]
pub struct FakeLinkError;

/// A [`LinkLayer`] double whose event stream is fed by the test and
/// whose outbound calls are all recorded for later assertions. Tracks
/// state per endpoint id (`open_endpoint`/`close_endpoint` only ever
/// touch endpoint 0 in practice, but `ENDPOINT_STATE_N` uframes name
/// arbitrary other endpoints, so the fixture has to tell them apart).
pub struct FakeLinkLayer {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    states: Arc<Mutex<HashMap<u8, EndpointState>>>,
}

/// The other half of [`FakeLinkLayer`]: feeds events in and inspects
/// recorded calls out, kept by the test driving the fixture.
pub struct FakeLinkLayerController {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    states: Arc<Mutex<HashMap<u8, EndpointState>>>,
}

impl FakeLinkLayerController {
    pub fn send(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Write { bytes, .. } => Some(bytes),
                _ => None,
            })
            .collect()
    }

    /// Set the state a subsequent `endpoint_state(endpoint_id)` query
    /// will report, for endpoints the fixture never itself opens/closes
    /// (e.g. the user-side endpoint named by an `ENDPOINT_STATE_N`
    /// uframe in scenario 6).
    pub fn set_endpoint_state(&self, endpoint_id: u8, state: EndpointState) {
        self.states.lock().unwrap().insert(endpoint_id, state);
    }
}

pub fn fake_link_layer() -> (FakeLinkLayer, FakeLinkLayerController) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let states = Arc::new(Mutex::new(HashMap::new()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FakeLinkLayer {
            calls: calls.clone(),
            events: rx,
            states: states.clone(),
        },
        FakeLinkLayerController { calls, events: tx, states },
    )
}

impl LinkLayer for FakeLinkLayer {
    type Error = FakeLinkError;

    async fn open_endpoint(&mut self, endpoint_id: u8, flags: OpenFlags, _tx_window: u8) -> Result<(), Self::Error> {
        self.states.lock().unwrap().insert(endpoint_id, EndpointState::Open);
        self.calls.lock().unwrap().push(RecordedCall::Open {
            endpoint_id,
            uframe_enable: flags.uframe_enable,
        });
        Ok(())
    }

    async fn close_endpoint(&mut self, endpoint_id: u8, force: bool, immediate: bool) -> Result<(), Self::Error> {
        self.states.lock().unwrap().insert(endpoint_id, EndpointState::Closed);
        self.calls.lock().unwrap().push(RecordedCall::Close { endpoint_id, force, immediate });
        Ok(())
    }

    async fn write(&mut self, endpoint_id: u8, bytes: &[u8], flags: WriteFlags) -> Result<(), Self::Error> {
        self.calls.lock().unwrap().push(RecordedCall::Write {
            endpoint_id,
            bytes: bytes.to_vec(),
            flags,
        });
        Ok(())
    }

    async fn flush_transmit_queue(&mut self) {
        self.calls.lock().unwrap().push(RecordedCall::Flush);
    }

    fn set_endpoint_in_error(&mut self, endpoint_id: u8, reason: EndpointErrorReason) {
        self.states.lock().unwrap().insert(endpoint_id, EndpointState::Error);
        self.calls.lock().unwrap().push(RecordedCall::SetEndpointInError { endpoint_id, reason });
    }

    fn endpoint_state(&self, endpoint_id: u8) -> EndpointState {
        self.states.lock().unwrap().get(&endpoint_id).copied().unwrap_or(EndpointState::Closed)
    }

    async fn recv_event(&mut self) -> LinkEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }
}

/// A [`ServerQuery`] double with a fixed, settable answer.
pub struct FakeServerQuery {
    listener_lists: Mutex<VecDeque<bool>>,
    default: bool,
}

impl FakeServerQuery {
    pub fn always(empty: bool) -> Self {
        Self {
            listener_lists: Mutex::new(VecDeque::new()),
            default: empty,
        }
    }
}

impl ServerQuery for FakeServerQuery {
    fn listener_list_empty(&self, _endpoint_id: u8) -> bool {
        self.listener_lists.lock().unwrap().pop_front().unwrap_or(self.default)
    }
}
