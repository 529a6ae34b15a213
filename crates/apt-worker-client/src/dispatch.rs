//! Pending-request table.
//!
//! One slot per command kind. A slot holds the sequence number the request
//! was sent with and the one-shot sender its reply goes to. Every reserved
//! slot is resolved exactly once: with the matching response, or with `None`
//! when it is cancelled.
//!
//! The status kind is different: it is a persistent subscription that every
//! status frame is delivered to, regardless of sequence number.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::oneshot;

use crate::bridge::protocol::{Command, Frame, Reply, Response};

/// Receiver of unsolicited status frames. Called with `None` once when the
/// subscription is cancelled. A callback that panics is dropped.
pub type StatusCallback = Box<dyn FnMut(Reply) + Send>;

/// Run the status callback, reporting whether it returned normally.
fn call_status(status: &mut StatusCallback, reply: Reply) -> bool {
    catch_unwind(AssertUnwindSafe(|| status(reply))).is_ok()
}

#[derive(Debug)]
struct PendingRequest {
    sequence: i32,
    reply: oneshot::Sender<Reply>,
}

/// Why a request was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A request of the same kind is still outstanding.
    Occupied,
    /// Status frames are subscribed to, never requested.
    StatusKind,
}

/// A refused reservation. Hands the reply sender back so the caller can
/// resolve it.
#[derive(Debug)]
pub struct Rejected {
    pub reason: RejectReason,
    reply: oneshot::Sender<Reply>,
}

impl Rejected {
    pub fn resolve_null(self) {
        let _ = self.reply.send(None);
    }
}

/// What happened to an incoming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Delivered { command: Command, sequence: i32 },
    Status { delivered: bool },
    /// The status subscriber panicked and has been removed.
    StatusSubscriberPanicked,
    UnknownCommand(i32),
    Stale {
        command: Command,
        expected: Option<i32>,
        received: i32,
    },
}

pub struct PendingTable {
    slots: [Option<PendingRequest>; Command::COUNT],
    status: Option<StatusCallback>,
    next_sequence: i32,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            status: None,
            next_sequence: 0,
        }
    }

    /// Claim the slot for `command` and assign it the next sequence number.
    pub fn reserve(
        &mut self,
        command: Command,
        reply: oneshot::Sender<Reply>,
    ) -> Result<i32, Rejected> {
        if command == Command::Status {
            return Err(Rejected {
                reason: RejectReason::StatusKind,
                reply,
            });
        }

        let slot = &mut self.slots[command.index()];
        if slot.is_some() {
            return Err(Rejected {
                reason: RejectReason::Occupied,
                reply,
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        *slot = Some(PendingRequest { sequence, reply });
        Ok(sequence)
    }

    pub fn is_pending(&self, command: Command) -> bool {
        self.slots[command.index()].is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Resolve the slot for `command` with `None`. Returns whether it was occupied.
    pub fn cancel(&mut self, command: Command) -> bool {
        match self.slots[command.index()].take() {
            Some(pending) => {
                let _ = pending.reply.send(None);
                true
            }
            None => false,
        }
    }

    /// Resolve every occupied slot with `None` and drop the status
    /// subscription (after telling it with `None`). Returns the number of
    /// requests cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for command in Command::ALL {
            if self.cancel(command) {
                cancelled += 1;
            }
        }
        if let Some(mut status) = self.status.take()
            && !call_status(&mut status, None)
        {
            tracing::error!("Status subscriber panicked while being cancelled");
        }
        cancelled
    }

    /// Install the status subscriber, replacing any previous one.
    pub fn subscribe_status(&mut self, callback: StatusCallback) {
        self.status = Some(callback);
    }

    pub fn has_status_subscriber(&self) -> bool {
        self.status.is_some()
    }

    /// Route one response frame.
    pub fn resolve(&mut self, frame: Frame) -> Resolution {
        let Some(command) = Command::from_id(frame.command) else {
            return Resolution::UnknownCommand(frame.command);
        };
        let response = Response::new(command, frame.state, frame.sequence, frame.payload);

        if command == Command::Status {
            let Some(status) = self.status.as_mut() else {
                return Resolution::Status { delivered: false };
            };
            if call_status(status, Some(response)) {
                return Resolution::Status { delivered: true };
            }
            self.status = None;
            return Resolution::StatusSubscriberPanicked;
        }

        let slot = &mut self.slots[command.index()];
        let expected = slot.as_ref().map(|pending| pending.sequence);
        if expected != Some(frame.sequence) {
            return Resolution::Stale {
                command,
                expected,
                received: frame.sequence,
            };
        }

        let Some(pending) = slot.take() else {
            return Resolution::Stale {
                command,
                expected,
                received: frame.sequence,
            };
        };
        let sequence = pending.sequence;
        if pending.reply.send(Some(response)).is_err() {
            tracing::debug!(%command, sequence, "Reply receiver dropped before response arrived");
        }
        Resolution::Delivered { command, sequence }
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("pending", &self.pending_count())
            .field("status_subscribed", &self.status.is_some())
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}
