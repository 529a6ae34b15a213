//! Client handle: starts the worker and issues requests to it.
//!
//! `WorkerClient` is cheap to clone. All clones share one worker session;
//! dropping the last one shuts the session down.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{Command, Reply};
use crate::bridge::transport::{FrameReader, WorkerChannels};
use crate::config::ClientConfig;
use crate::host::Host;
use crate::lifecycle::{self, LaunchedWorker, StartupError};
use crate::progress;
use crate::session::{Session, SessionMessage, SessionState, SharedState};
use crate::status::WorkerStatus;

#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<ClientConfig>,
    host: Host,
    shared: Arc<SharedState>,
    startup: StdMutex<Option<CancellationToken>>,
}

impl ClientInner {
    fn abort_startup(&self) {
        let token = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.abort_startup();
        self.shared.shutdown();
    }
}

impl WorkerClient {
    pub fn new(config: ClientConfig, host: Host) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config: Arc::new(config),
                host,
                shared: Arc::new(SharedState::default()),
                startup: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// Spawn the worker and begin the handshake. Returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<StartupHandle, StartupError> {
        self.start_with_ticks(|| {})
    }

    /// Like [`start`](Self::start), calling `on_tick` once per retry interval
    /// while the handshake waits (for a startup progress indicator).
    pub fn start_with_ticks<F>(&self, on_tick: F) -> Result<StartupHandle, StartupError>
    where
        F: FnMut() + Send + 'static,
    {
        let generation = self.inner.shared.begin_start()?;
        let cancel = CancellationToken::new();
        *self
            .inner
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        let config = Arc::clone(&self.inner.config);
        let host = self.inner.host.clone();
        let shared = Arc::clone(&self.inner.shared);
        let token = cancel.clone();

        tracing::debug!(generation, "Starting apt-worker");
        let task = tokio::spawn(async move {
            match lifecycle::launch(&config, &token, on_tick).await {
                Ok(launched) => install(generation, launched, &config, &host, &shared),
                Err(e) => {
                    shared.end_generation(generation, SessionState::NotStarted);
                    tracing::warn!(error = %e, "apt-worker failed to start");
                    Err(e)
                }
            }
        });

        Ok(StartupHandle { cancel, task })
    }

    /// Send one request. The returned future resolves to the response, or to
    /// `None` if the worker is not running, a request of the same kind is
    /// already outstanding, or the transport fails first.
    ///
    /// The request is queued before this returns. Dropping the `PendingReply`
    /// discards the response but does not free the command's slot early.
    pub fn issue(&self, command: Command, state: i32, payload: Bytes) -> PendingReply {
        let (reply, rx) = oneshot::channel();
        let msg = SessionMessage::Issue {
            command,
            state,
            payload,
            reply,
        };

        match self.inner.shared.sender() {
            Some(tx) => {
                if let Err(mpsc::error::SendError(msg)) = tx.send(msg) {
                    tracing::warn!(%command, "apt-worker session has stopped");
                    msg.reject();
                }
            }
            None => {
                tracing::warn!(%command, "apt-worker is not running");
                msg.reject();
            }
        }

        PendingReply { rx }
    }

    /// Receive every unsolicited status frame. Replaces any earlier
    /// subscription. The callback gets `None` once if the worker fails, and
    /// is dropped afterwards.
    pub fn register_status_subscription<F>(&self, callback: F)
    where
        F: FnMut(Reply) + Send + 'static,
    {
        self.inner.shared.subscribe_status(Box::new(callback));
    }

    /// Ask the worker to abandon its current operation. Does not wait.
    pub fn request_cancel(&self) {
        if let Some(tx) = self.inner.shared.sender() {
            let _ = tx.send(SessionMessage::Cancel);
        }
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    pub fn status(&self) -> WorkerStatus {
        self.inner.shared.status()
    }

    /// Abort a pending startup or stop the running session. Outstanding
    /// requests resolve to `None`; the worker sees end-of-stream and exits.
    pub fn shutdown(&self) {
        self.inner.abort_startup();
        self.inner.shared.shutdown();
    }
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("status", &self.status())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Hand a launched worker to its session and progress reader.
fn install(
    generation: u64,
    launched: LaunchedWorker,
    config: &ClientConfig,
    host: &Host,
    shared: &Arc<SharedState>,
) -> Result<(), StartupError> {
    let LaunchedWorker { child, channels } = launched;
    let WorkerChannels {
        requests,
        responses,
        status,
        cancel,
    } = channels;

    let (tx, rx) = mpsc::unbounded_channel();
    if !shared.finish_start(generation, tx) {
        // Shut down while the handshake was running. Dropping the channels
        // closes them and the worker exits on end-of-stream.
        tracing::debug!(generation, "Discarding worker started for an abandoned generation");
        return Err(StartupError::Cancelled);
    }

    tokio::spawn(progress::run_progress_reader(
        status,
        Arc::clone(&host.progress),
    ));

    let codec = FrameCodec::new().with_max_payload_len(config.max_payload_len);
    let session = Session::new(
        generation,
        requests,
        cancel,
        child,
        codec.clone(),
        Arc::clone(&host.notifier),
        Arc::clone(shared),
    );
    tokio::spawn(session.run(FrameReader::new(responses, codec), rx));
    Ok(())
}

/// Handle to an in-progress startup.
#[derive(Debug)]
pub struct StartupHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), StartupError>>,
}

impl StartupHandle {
    /// Abort the handshake. `wait` then reports `StartupError::Cancelled`.
    /// No effect once startup has finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the handshake outcome.
    pub async fn wait(self) -> Result<(), StartupError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(StartupError::Internal(format!("startup task failed: {e}"))),
        }
    }
}

/// Reply to an issued request. Resolves exactly once.
#[derive(Debug)]
#[must_use = "the response is lost unless the reply is awaited"]
pub struct PendingReply {
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    /// The reply if it has already arrived, without waiting.
    pub fn try_reply(&mut self) -> Option<Reply> {
        match self.rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(None),
        }
    }
}

impl Future for PendingReply {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(None))
    }
}
