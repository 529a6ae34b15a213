//! Session event loop: the single owner of a running worker's transport.
//!
//! Flow:
//! 1. Client handles send `SessionMessage`s over an unbounded channel
//! 2. The loop writes request frames and reads response frames
//! 3. Responses are routed through the pending table to one-shot replies
//! 4. On any transport failure: drop the descriptors, null every pending
//!    reply, notify the user once, mark the worker failed
//!
//! Replies and the status callback never run code that can reach back into
//! the loop synchronously, so response handling cannot re-enter itself.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::net::unix::pipe;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{Command, Frame, Reply};
use crate::bridge::transport::{FrameReader, FrameWriter, TransportError};
use crate::dispatch::{PendingTable, Resolution, StatusCallback};
use crate::host::{UserNotifier, messages};
use crate::lifecycle::StartupError;
use crate::status::WorkerStatus;

/// Cancel signal byte; the worker ignores its value.
const CANCEL_BYTE: u8 = 0;

pub(crate) enum SessionMessage {
    Issue {
        command: Command,
        state: i32,
        payload: Bytes,
        reply: oneshot::Sender<Reply>,
    },
    SubscribeStatus(StatusCallback),
    Cancel,
    Shutdown,
}

impl SessionMessage {
    /// Resolve whatever reply the message carries with `None`.
    pub(crate) fn reject(self) {
        if let SessionMessage::Issue { reply, .. } = self {
            let _ = reply.send(None);
        }
    }
}

pub(crate) enum SessionState {
    NotStarted,
    Starting {
        generation: u64,
    },
    Running {
        generation: u64,
        tx: mpsc::UnboundedSender<SessionMessage>,
    },
    Failed,
}

impl SessionState {
    fn generation(&self) -> Option<u64> {
        match self {
            Self::Starting { generation } | Self::Running { generation, .. } => Some(*generation),
            Self::NotStarted | Self::Failed => None,
        }
    }

    fn status(&self) -> WorkerStatus {
        match self {
            Self::NotStarted => WorkerStatus::NotStarted,
            Self::Starting { .. } => WorkerStatus::Starting,
            Self::Running { .. } => WorkerStatus::Running,
            Self::Failed => WorkerStatus::Failed,
        }
    }
}

struct SharedInner {
    state: SessionState,
    next_generation: u64,
    /// Status subscription registered while no session was running.
    parked_status: Option<StatusCallback>,
}

/// State shared between client handles, the startup task and the session.
///
/// Every lifecycle run gets a generation number; a task may only move the
/// state while it still owns the current generation, so a stale session
/// cannot clobber a newer one.
pub(crate) struct SharedState {
    inner: StdMutex<SharedInner>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            inner: StdMutex::new(SharedInner {
                state: SessionState::NotStarted,
                next_generation: 0,
                parked_status: None,
            }),
        }
    }
}

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        // Nothing here can be left half-updated by a panic.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        self.lock().state.status()
    }

    /// Sender to the running session, if any.
    pub(crate) fn sender(&self) -> Option<mpsc::UnboundedSender<SessionMessage>> {
        match &self.lock().state {
            SessionState::Running { tx, .. } => Some(tx.clone()),
            _ => None,
        }
    }

    /// Claim a new generation and move to Starting.
    pub(crate) fn begin_start(&self) -> Result<u64, StartupError> {
        let mut inner = self.lock();
        if !inner.state.status().can_start() {
            return Err(StartupError::AlreadyRunning);
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.state = SessionState::Starting { generation };
        Ok(generation)
    }

    /// Publish the running session. A parked status subscription is queued
    /// first so it reaches the session before any request can. Returns
    /// `false` when the generation was abandoned in the meantime.
    pub(crate) fn finish_start(
        &self,
        generation: u64,
        tx: mpsc::UnboundedSender<SessionMessage>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.state.generation() != Some(generation) {
            return false;
        }
        if let Some(callback) = inner.parked_status.take()
            && let Err(mpsc::error::SendError(msg)) = tx.send(SessionMessage::SubscribeStatus(callback))
            && let SessionMessage::SubscribeStatus(callback) = msg
        {
            inner.parked_status = Some(callback);
        }
        inner.state = SessionState::Running { generation, tx };
        true
    }

    /// Leave `generation` for `next`. No-op if a different generation owns the state.
    pub(crate) fn end_generation(&self, generation: u64, next: SessionState) -> bool {
        let mut inner = self.lock();
        if inner.state.generation() != Some(generation) {
            return false;
        }
        inner.state = next;
        true
    }

    /// Deliver a status subscription to the running session, or keep it
    /// until the next one starts.
    pub(crate) fn subscribe_status(&self, callback: StatusCallback) {
        let mut inner = self.lock();
        let callback = match &inner.state {
            SessionState::Running { tx, .. } => {
                match tx.send(SessionMessage::SubscribeStatus(callback)) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(SessionMessage::SubscribeStatus(callback))) => {
                        callback
                    }
                    Err(_) => return,
                }
            }
            _ => callback,
        };
        inner.parked_status = Some(callback);
    }

    /// Stop whatever generation is current and return to NotStarted.
    pub(crate) fn shutdown(&self) {
        let previous = std::mem::replace(&mut self.lock().state, SessionState::NotStarted);
        if let SessionState::Running { tx, .. } = previous {
            let _ = tx.send(SessionMessage::Shutdown);
        }
    }
}

/// The event loop's owned state for one running worker.
pub(crate) struct Session {
    generation: u64,
    writer: Option<FrameWriter<pipe::Sender>>,
    cancel: Option<pipe::Sender>,
    child: Option<Child>,
    table: PendingTable,
    notifier: Arc<dyn UserNotifier>,
    shared: Arc<SharedState>,
}

impl Session {
    pub(crate) fn new(
        generation: u64,
        requests: pipe::Sender,
        cancel: pipe::Sender,
        child: Child,
        codec: FrameCodec,
        notifier: Arc<dyn UserNotifier>,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            generation,
            writer: Some(FrameWriter::new(requests, codec)),
            cancel: Some(cancel),
            child: Some(child),
            table: PendingTable::new(),
            notifier,
            shared,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut reader: FrameReader<pipe::Receiver>,
        mut rx: mpsc::UnboundedReceiver<SessionMessage>,
    ) {
        tracing::debug!(generation = self.generation, "Session event loop started");

        loop {
            tokio::select! {
                biased;

                frame = reader.read_frame() => {
                    match frame {
                        Ok(frame) => self.handle_response(frame),
                        Err(e) => {
                            self.notice_failure(&e);
                            break;
                        }
                    }
                }

                msg = rx.recv() => {
                    match msg {
                        Some(SessionMessage::Issue { command, state, payload, reply }) => {
                            if let Err(e) = self.issue(command, state, payload, reply).await {
                                self.notice_failure(&e);
                                break;
                            }
                        }
                        Some(SessionMessage::SubscribeStatus(callback)) => {
                            tracing::debug!("Status subscription registered");
                            self.table.subscribe_status(callback);
                        }
                        Some(SessionMessage::Cancel) => self.request_cancel(),
                        Some(SessionMessage::Shutdown) | None => {
                            self.shutdown();
                            break;
                        }
                    }
                }
            }
        }

        // Anything queued after the loop stopped gets a null reply.
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            msg.reject();
        }
        self.reap();
        tracing::debug!(generation = self.generation, "Session event loop exiting");
    }

    async fn issue(
        &mut self,
        command: Command,
        state: i32,
        payload: Bytes,
        reply: oneshot::Sender<Reply>,
    ) -> Result<(), TransportError> {
        let sequence = match self.table.reserve(command, reply) {
            Ok(sequence) => sequence,
            Err(rejected) => {
                tracing::warn!(%command, reason = ?rejected.reason, "Rejecting apt-worker request");
                rejected.resolve_null();
                return Ok(());
            }
        };

        let Some(writer) = self.writer.as_mut() else {
            self.table.cancel(command);
            return Ok(());
        };

        tracing::debug!(%command, state, sequence, payload_bytes = payload.len(), "Sending request");
        match writer
            .write_frame(Frame::new(command, state, sequence, payload))
            .await
        {
            Ok(()) => Ok(()),
            // Rejected by the encoder before anything hit the pipe.
            Err(TransportError::Malformed(e)) => {
                tracing::error!(%command, error = %e, "Request not sent");
                self.table.cancel(command);
                Ok(())
            }
            // The slot stays reserved; the failure path nulls it with the rest.
            Err(e) => Err(e),
        }
    }

    fn handle_response(&mut self, frame: Frame) {
        let payload_bytes = frame.payload.len();
        match self.table.resolve(frame) {
            Resolution::Delivered { command, sequence } => {
                tracing::debug!(%command, sequence, payload_bytes, "Response delivered");
            }
            Resolution::Status { delivered: true } => {
                tracing::trace!(payload_bytes, "Status frame delivered");
            }
            Resolution::Status { delivered: false } => {
                tracing::debug!("Status frame with no subscriber");
            }
            Resolution::StatusSubscriberPanicked => {
                tracing::error!(payload_bytes, "Status subscriber panicked; subscription dropped");
            }
            Resolution::UnknownCommand(command) => {
                tracing::warn!(command, "Ignoring response with unrecognized command");
            }
            Resolution::Stale {
                command,
                expected,
                received,
            } => {
                tracing::warn!(%command, ?expected, received, "Ignoring out of sequence reply");
            }
        }
    }

    /// Ask the worker to abandon its current operation. Does not wait.
    fn request_cancel(&mut self) {
        let Some(cancel) = self.cancel.as_ref() else {
            return;
        };
        match cancel.try_write(&[CANCEL_BYTE]) {
            Ok(1) => tracing::debug!("Cancel requested"),
            Ok(n) => tracing::warn!(written = n, "Short write on cancel pipe"),
            Err(e) => tracing::warn!(error = %e, "Failed to write cancel request"),
        }
    }

    fn invalidate(&mut self) {
        // Taking the Options closes each descriptor exactly once.
        self.writer.take();
        self.cancel.take();
    }

    fn notice_failure(&mut self, err: &TransportError) {
        tracing::error!(error = %err, generation = self.generation, "apt-worker transport failed");
        self.invalidate();
        self.shared
            .end_generation(self.generation, SessionState::Failed);
        let cancelled = self.table.cancel_all();
        if cancelled > 0 {
            tracing::warn!(cancelled, "Cancelled pending apt-worker requests");
        }
        self.notifier
            .annoy_user_with_log(messages::OPERATION_FAILED);
    }

    fn shutdown(&mut self) {
        tracing::info!(generation = self.generation, "Shutting down apt-worker session");
        self.invalidate();
        self.shared
            .end_generation(self.generation, SessionState::NotStarted);
        self.table.cancel_all();
    }

    /// Collect the worker's exit status in the background.
    fn reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => tracing::info!(%status, "apt-worker exited"),
                    Err(e) => tracing::warn!(error = %e, "Failed to wait for apt-worker"),
                }
            });
        }
    }
}
