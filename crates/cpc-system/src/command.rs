//! Command Table: the ordered collection of in-flight [`CommandHandle`]s.
//!
//! Single-threaded, owned exclusively by [`crate::engine::SystemEndpointCore`];
//! no locking, no atomics beyond what [`CommandSeq`] itself needs. Backed by
//! `indexmap::IndexMap` rather than `std::collections::HashMap` so that
//! `drain()` (used by endpoint reset) observes push-back order, matching the
//! C source's singly-linked-list `sl_slist_t` semantics.

use std::time::Duration;

use indexmap::IndexMap;

use crate::wire::{CommandSeq, PropertyId, SystemStatus};

/// What happens when a command's final callback fires, keyed by the
/// command kind so each callback gets the arguments the operation it
/// answers actually needs. The first argument is always the command's
/// own sequence number — the idiomatic stand-in for the C source's
/// `sl_cpc_system_command_handle_t *` identity, since the handle itself
/// is torn down immediately after the callback runs.
pub enum Callback {
    Noop(Box<dyn FnOnce(CommandSeq, SystemStatus) + Send>),
    /// `(seq, error_status, reset_status)`.
    Reset(Box<dyn FnOnce(CommandSeq, SystemStatus, SystemStatus) + Send>),
    /// `(seq, property_id, value, error_status)`.
    Property(Box<dyn FnOnce(CommandSeq, PropertyId, Vec<u8>, SystemStatus) + Send>),
}

/// A single in-flight command: its retransmittable frame, its callback,
/// and the retry bookkeeping the Timer Manager and Request Engine share.
pub struct CommandHandle {
    pub seq: CommandSeq,
    pub frame: Vec<u8>,
    pub callback: Callback,
    pub retries_remaining: u8,
    pub retry_period: Duration,
    /// Set to `SystemStatus::InProgress` the first time a retry fires;
    /// read back by final-arrival to decide what status the callback
    /// observes if the peer never reported one explicitly.
    pub error_status: SystemStatus,
}

impl CommandHandle {
    pub fn new(
        seq: CommandSeq,
        frame: Vec<u8>,
        callback: Callback,
        retries_remaining: u8,
        retry_period: Duration,
    ) -> Self {
        Self {
            seq,
            frame,
            callback,
            retries_remaining,
            retry_period,
            error_status: SystemStatus::Ok,
        }
    }
}

/// The ordered map of in-flight commands, keyed by sequence number.
#[derive(Default)]
pub struct CommandTable {
    handles: IndexMap<CommandSeq, CommandHandle>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Append a handle to the back of the table. `seq` must not already
    /// be present — the engine is responsible for not reusing a
    /// sequence number still in flight.
    pub fn push_back(&mut self, handle: CommandHandle) {
        let seq = handle.seq;
        let previous = self.handles.insert(seq, handle);
        debug_assert!(previous.is_none(), "command seq {seq} reused while still in flight");
    }

    /// Remove and reinsert a handle at the back of the table, as the C
    /// source does on every retry (`sl_slist_remove` + `sl_slist_push_back`).
    /// Observable only via [`Self::drain`] order, but kept faithful to the
    /// original's queueing discipline.
    pub fn move_to_back(&mut self, seq: CommandSeq) {
        if let Some(handle) = self.handles.shift_remove(&seq) {
            self.handles.insert(seq, handle);
        }
    }

    pub fn find_by_seq(&self, seq: CommandSeq) -> Option<&CommandHandle> {
        self.handles.get(&seq)
    }

    pub fn find_by_seq_mut(&mut self, seq: CommandSeq) -> Option<&mut CommandHandle> {
        self.handles.get_mut(&seq)
    }

    pub fn remove(&mut self, seq: CommandSeq) -> Option<CommandHandle> {
        self.handles.shift_remove(&seq)
    }

    /// Remove every handle, in push-back order, for endpoint reset.
    pub fn drain(&mut self) -> impl Iterator<Item = CommandHandle> + '_ {
        self.handles.drain(..).map(|(_, handle)| handle)
    }
}
