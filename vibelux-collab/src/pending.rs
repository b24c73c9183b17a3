//! Local edits the hub has not acknowledged yet.
//!
//! At most one edit is in flight; later ones wait in a buffer and go out
//! one per acknowledgement, each based on the version the previous ack
//! reported. A remote edit the hub applied first is transformed through
//! every pending edit, so the buffer stays valid against the hub's
//! document and the remote edit comes out valid against the local one.
//!
//! ```text
//!   hub:    v ── R ─────────────────► v+1
//!   local:  v ── I ── B1 ── B2  ──► R″ applied locally
//!                (I, B1, B2 rebased over R)
//! ```
//!
//! Remote edits win position ties, matching the hub's rebase.

use std::collections::VecDeque;

use crate::ot::{self, Operation, Priority};

#[derive(Debug, Default)]
pub struct PendingEdits {
    in_flight: Option<Operation>,
    buffer: VecDeque<Operation>,
}

impl PendingEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a local edit that is already applied to the local document.
    pub fn push(&mut self, operation: Operation) {
        self.buffer.push_back(operation);
    }

    /// Promote the oldest buffered edit to in-flight and return it.
    /// `None` while an edit is still awaiting its acknowledgement.
    pub fn next_to_send(&mut self) -> Option<Operation> {
        if self.in_flight.is_some() {
            return None;
        }
        let operation = self.buffer.pop_front()?;
        self.in_flight = Some(operation.clone());
        Some(operation)
    }

    /// The hub accepted the in-flight edit. False if none was in flight.
    pub fn acknowledge(&mut self) -> bool {
        self.in_flight.take().is_some()
    }

    /// Rebase every pending edit over `remote`, returning `remote` rebased
    /// over the pending edits.
    pub fn transform_remote(&mut self, remote: &Operation) -> Operation {
        let mut remote = remote.clone();
        for local in self.in_flight.iter_mut().chain(self.buffer.iter_mut()) {
            let (rebased_local, rebased_remote) = ot::transform(local, &remote, Priority::Right);
            *local = rebased_local;
            remote = rebased_remote;
        }
        remote
    }

    /// Move an unacknowledged in-flight edit back to the head of the
    /// buffer so it is sent again.
    pub fn requeue(&mut self) {
        if let Some(operation) = self.in_flight.take() {
            self.buffer.push_front(operation);
        }
    }

    /// Forget everything, returning how many edits were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.len();
        self.in_flight = None;
        self.buffer.clear();
        dropped
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn len(&self) -> usize {
        self.buffer.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.buffer.is_empty()
    }
}
