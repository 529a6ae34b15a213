//! Test doubles: a fake apt-worker speaking the real FIFO protocol, a
//! spawner that starts it, and host sinks that record what they receive.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nix::errno::Errno;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::Frame;
use crate::bridge::transport::PipePaths;
use crate::host::{ProgressSink, UserNotifier};
use crate::lifecycle::{SpawnError, WorkerCommand, WorkerSpawner};
use crate::progress::ProgressUpdate;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker side of the four FIFOs.
pub struct FakeWorker {
    requests: Option<FramedRead<pipe::Receiver, FrameCodec>>,
    responses: FramedWrite<pipe::Sender, FrameCodec>,
    status: pipe::Sender,
    cancel: pipe::Receiver,
}

impl FakeWorker {
    /// Open the FIFOs in the order apt-worker does.
    pub async fn connect(paths: PipePaths) -> io::Result<Self> {
        let requests = pipe::OpenOptions::new().open_receiver(&paths.to_worker)?;
        let responses = open_sender_when_ready(&paths.from_worker).await?;
        let status = open_sender_when_ready(&paths.status).await?;
        let cancel = pipe::OpenOptions::new().open_receiver(&paths.cancel)?;
        Ok(Self {
            requests: Some(FramedRead::new(requests, FrameCodec::new())),
            responses: FramedWrite::new(responses, FrameCodec::new()),
            status,
            cancel,
        })
    }

    pub async fn next_request(&mut self) -> Frame {
        self.try_next_request()
            .await
            .expect("client closed the request pipe")
    }

    /// `None` once the client has closed the request pipe.
    pub async fn try_next_request(&mut self) -> Option<Frame> {
        let requests = self.requests.as_mut().expect("request pipe already closed");
        tokio::time::timeout(TEST_TIMEOUT, requests.next())
            .await
            .expect("timed out waiting for a request")
            .map(|frame| frame.expect("malformed request frame"))
    }

    /// Close the request pipe only; responses, status and cancel stay open.
    pub fn close_requests(&mut self) {
        self.requests.take();
    }

    pub async fn respond(&mut self, frame: Frame) {
        self.responses.send(frame).await.expect("write response");
    }

    pub async fn write_status(&mut self, bytes: &[u8]) {
        self.status.write_all(bytes).await.expect("write status");
    }

    pub async fn read_cancel_byte(&mut self) -> u8 {
        let mut byte = [0xff];
        tokio::time::timeout(TEST_TIMEOUT, self.cancel.read_exact(&mut byte))
            .await
            .expect("timed out waiting for cancel")
            .expect("read cancel");
        byte[0]
    }
}

async fn open_sender_when_ready(path: &Path) -> io::Result<pipe::Sender> {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(e)
                if e.raw_os_error() == Some(Errno::ENXIO as i32)
                    && tokio::time::Instant::now() < deadline =>
            {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Spawns a short-lived placeholder process and connects a `FakeWorker` to
/// the FIFOs named on the command line.
pub struct FakeSpawner {
    spawned: StdMutex<Vec<WorkerCommand>>,
    hold: AtomicBool,
    workers_tx: mpsc::UnboundedSender<FakeWorker>,
    workers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeWorker>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        let (workers_tx, workers_rx) = mpsc::unbounded_channel();
        Self {
            spawned: StdMutex::new(Vec::new()),
            hold: AtomicBool::new(false),
            workers_tx,
            workers_rx: tokio::sync::Mutex::new(workers_rx),
        }
    }

    /// Spawn processes but never connect a worker to the FIFOs.
    pub fn hold_handshake(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<WorkerCommand> {
        self.spawned.lock().unwrap().clone()
    }

    pub async fn take_worker(&self) -> Option<FakeWorker> {
        let mut rx = self.workers_rx.lock().await;
        tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .ok()
            .flatten()
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        self.spawned.lock().unwrap().push(command.clone());

        let child = Command::new("true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: "true".to_string(),
                source,
            })?;

        if !self.hold.load(Ordering::SeqCst) {
            // argv: <worker> <to> <from> <status> <cancel> <options>
            let fifo = |i: usize| PathBuf::from(&command.args[i]);
            let paths = PipePaths {
                to_worker: fifo(1),
                from_worker: fifo(2),
                status: fifo(3),
                cancel: fifo(4),
            };
            let tx = self.workers_tx.clone();
            tokio::spawn(async move {
                let worker = FakeWorker::connect(paths)
                    .await
                    .expect("fake worker failed to connect");
                let _ = tx.send(worker);
            });
        }

        Ok(child)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: StdMutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl UserNotifier for RecordingNotifier {
    fn annoy_user_with_log(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Everything a `ProgressSink` was told, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Shown(String),
    Title(String),
    ResetCancelled,
}

#[derive(Default)]
pub struct RecordingProgress {
    updates: StdMutex<Vec<ProgressUpdate>>,
    events: StdMutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn set_progress(&self, update: &ProgressUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }

    fn show_progress(&self, title: &str) {
        self.events
            .lock()
            .unwrap()
            .push(ProgressEvent::Shown(title.to_string()));
    }

    fn set_general_title(&self, title: &str) {
        self.events
            .lock()
            .unwrap()
            .push(ProgressEvent::Title(title.to_string()));
    }

    fn reset_cancelled(&self) {
        self.events.lock().unwrap().push(ProgressEvent::ResetCancelled);
    }
}
