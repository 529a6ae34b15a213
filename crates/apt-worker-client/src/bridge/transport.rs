//! Named-pipe transport between the client and apt-worker.
//!
//! Both sides open the same four FIFOs in the same order. A FIFO `open`
//! only completes once the peer has the other end open, so any difference in
//! order deadlocks both processes.
//!
//! Opening is two-phase:
//! 1. **Rendezvous**: `open(O_NONBLOCK)`. A write-side open fails with `ENXIO`
//!    while the worker has not opened its read side yet; that step is retried.
//! 2. **Handoff**: the opened file is converted into a tokio pipe end
//!    registered with the reactor. All later I/O is readiness-driven, and the
//!    codec buffers partial frames instead of blocking on them.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{FrameCodec, FrameError};
use super::protocol::Frame;

pub const DEFAULT_PIPE_DIR: &str = "/tmp";

/// Filesystem locations of the four rendezvous FIFOs.
///
/// Path format: `{dir}/apt-worker.{to,from,status,cancel}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    pub to_worker: PathBuf,
    pub from_worker: PathBuf,
    pub status: PathBuf,
    pub cancel: PathBuf,
}

impl Default for PipePaths {
    fn default() -> Self {
        Self::in_dir(DEFAULT_PIPE_DIR)
    }
}

impl PipePaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            to_worker: dir.join("apt-worker.to"),
            from_worker: dir.join("apt-worker.from"),
            status: dir.join("apt-worker.status"),
            cancel: dir.join("apt-worker.cancel"),
        }
    }

    /// Paths in handshake order; also the order the worker expects them on its command line.
    pub fn in_order(&self) -> [&Path; 4] {
        [
            &self.to_worker,
            &self.from_worker,
            &self.status,
            &self.cancel,
        ]
    }

    /// Create all four FIFOs (mode 0600), replacing whatever is at those paths.
    pub fn create_fifos(&self) -> Result<(), (PathBuf, io::Error)> {
        for path in self.in_order() {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed stale fifo"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale fifo"),
            }

            nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(|e| (path.to_path_buf(), io::Error::from(e)))?;
            tracing::trace!(path = %path.display(), "Created fifo");
        }
        Ok(())
    }

    /// Remove the FIFO paths. They only exist for the rendezvous.
    pub fn remove(&self) {
        for path in self.in_order() {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove fifo");
            }
        }
    }
}

/// Position in the fixed open order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeStep {
    /// Client → worker requests, opened for writing.
    ToWorker,
    /// Worker → client responses, opened for reading.
    FromWorker,
    /// Progress text, opened for reading.
    Status,
    /// Cancel signal, opened for writing.
    Cancel,
    Done,
}

impl HandshakeStep {
    fn next(self) -> Self {
        match self {
            Self::ToWorker => Self::FromWorker,
            Self::FromWorker => Self::Status,
            Self::Status => Self::Cancel,
            Self::Cancel | Self::Done => Self::Done,
        }
    }
}

/// The four channel ends after a completed handshake.
#[derive(Debug)]
pub struct WorkerChannels {
    pub requests: pipe::Sender,
    pub responses: pipe::Receiver,
    pub status: pipe::Receiver,
    pub cancel: pipe::Sender,
}

/// Handshake progress: descriptors opened so far, in order.
///
/// Dropping it closes whatever was opened, which is how a timed-out or
/// cancelled handshake releases partial state.
#[derive(Debug)]
pub struct Rendezvous {
    paths: PipePaths,
    step: HandshakeStep,
    requests: Option<pipe::Sender>,
    responses: Option<pipe::Receiver>,
    status: Option<pipe::Receiver>,
    cancel: Option<pipe::Sender>,
}

impl Rendezvous {
    pub fn new(paths: PipePaths) -> Self {
        Self {
            paths,
            step: HandshakeStep::ToWorker,
            requests: None,
            responses: None,
            status: None,
            cancel: None,
        }
    }

    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    pub fn is_complete(&self) -> bool {
        self.step == HandshakeStep::Done
    }

    /// Open as many remaining steps as the worker currently allows.
    ///
    /// Returns `true` once all four descriptors are open. Must run inside a
    /// tokio runtime (opened ends are registered with the reactor).
    pub fn advance(&mut self) -> bool {
        while self.step != HandshakeStep::Done {
            match self.open_step() {
                Ok(()) => {
                    tracing::trace!(step = ?self.step, "Opened worker channel");
                    self.step = self.step.next();
                }
                Err(e) if is_rendezvous_pending(&e) => {
                    tracing::trace!(step = ?self.step, "Worker not listening yet");
                    break;
                }
                Err(e) => {
                    tracing::warn!(step = ?self.step, error = %e, "Failed to open worker channel");
                    break;
                }
            }
        }
        self.is_complete()
    }

    fn open_step(&mut self) -> io::Result<()> {
        match self.step {
            HandshakeStep::ToWorker => {
                let file = open_nonblocking(&self.paths.to_worker, Access::Write)?;
                self.requests = Some(pipe::Sender::from_file(file)?);
            }
            HandshakeStep::FromWorker => {
                let file = open_nonblocking(&self.paths.from_worker, Access::Read)?;
                self.responses = Some(pipe::Receiver::from_file(file)?);
            }
            HandshakeStep::Status => {
                let file = open_nonblocking(&self.paths.status, Access::Read)?;
                self.status = Some(pipe::Receiver::from_file(file)?);
            }
            HandshakeStep::Cancel => {
                let file = open_nonblocking(&self.paths.cancel, Access::Write)?;
                self.cancel = Some(pipe::Sender::from_file(file)?);
            }
            HandshakeStep::Done => {}
        }
        Ok(())
    }

    /// Hand the opened channels over. `None` until every step has completed.
    pub fn into_channels(self) -> Option<WorkerChannels> {
        Some(WorkerChannels {
            requests: self.requests?,
            responses: self.responses?,
            status: self.status?,
            cancel: self.cancel?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

fn open_nonblocking(path: &Path, access: Access) -> io::Result<File> {
    let mut options = OpenOptions::new();
    match access {
        Access::Read => options.read(true),
        Access::Write => options.write(true),
    };
    options.custom_flags(OFlag::O_NONBLOCK.bits()).open(path)
}

/// The peer has not opened its end yet: retry later rather than fail.
fn is_rendezvous_pending(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == Some(Errno::ENXIO as i32)
        || err.raw_os_error() == Some(Errno::EAGAIN as i32)
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("apt-worker closed the channel")]
    PeerClosed,
    #[error("apt-worker closed the channel inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("malformed frame: {0}")]
    Malformed(FrameError),
    #[error("channel I/O failed: {0}")]
    Io(#[source] io::Error),
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Truncated { buffered } => Self::Truncated { buffered },
            FrameError::Io(e) => e.into(),
            other => Self::Malformed(other),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::WriteZero | io::ErrorKind::UnexpectedEof => {
                Self::PeerClosed
            }
            _ => Self::Io(err),
        }
    }
}

/// Request side of the data channel. A write completes only when the whole
/// header and payload have been accepted by the pipe.
pub struct FrameWriter<W> {
    inner: FramedWrite<W, FrameCodec>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, codec: FrameCodec) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec),
        }
    }

    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner.send(frame).await.map_err(TransportError::from)
    }
}

/// Response side of the data channel. Yields complete frames only.
///
/// `read_frame` is cancel-safe: bytes of a partially received frame stay
/// buffered in the codec if the future is dropped.
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::PeerClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Command;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn pipe_paths_follow_worker_naming() {
        let paths = PipePaths::default();
        assert_eq!(paths.to_worker, PathBuf::from("/tmp/apt-worker.to"));
        assert_eq!(paths.from_worker, PathBuf::from("/tmp/apt-worker.from"));
        assert_eq!(paths.status, PathBuf::from("/tmp/apt-worker.status"));
        assert_eq!(paths.cancel, PathBuf::from("/tmp/apt-worker.cancel"));
    }

    #[test]
    fn create_fifos_replaces_stale_files() {
        use std::os::unix::fs::FileTypeExt;

        let dir = tempfile::tempdir().unwrap();
        let paths = PipePaths::in_dir(dir.path());
        std::fs::write(&paths.status, b"stale").unwrap();

        paths.create_fifos().unwrap();
        for path in paths.in_order() {
            let meta = std::fs::metadata(path).unwrap();
            assert!(meta.file_type().is_fifo(), "{} is not a fifo", path.display());
        }

        paths.remove();
        for path in paths.in_order() {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn rendezvous_opens_in_worker_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PipePaths::in_dir(dir.path());
        paths.create_fifos().unwrap();

        let mut rendezvous = Rendezvous::new(paths.clone());
        assert!(!rendezvous.advance());
        assert_eq!(rendezvous.step(), HandshakeStep::ToWorker);

        // Worker opens its read side of the request pipe.
        let _worker_requests = pipe::OpenOptions::new()
            .open_receiver(&paths.to_worker)
            .unwrap();

        // Both read-side opens go through immediately; cancel waits for the worker.
        assert!(!rendezvous.advance());
        assert_eq!(rendezvous.step(), HandshakeStep::Cancel);

        let _worker_cancel = pipe::OpenOptions::new()
            .open_receiver(&paths.cancel)
            .unwrap();
        assert!(rendezvous.advance());
        assert!(rendezvous.into_channels().is_some());
    }

    #[tokio::test]
    async fn incomplete_rendezvous_yields_no_channels() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PipePaths::in_dir(dir.path());
        paths.create_fifos().unwrap();

        let mut rendezvous = Rendezvous::new(paths);
        assert!(!rendezvous.advance());
        assert!(rendezvous.into_channels().is_none());
    }

    #[tokio::test]
    async fn frames_survive_the_duplex() {
        let (client, worker) = tokio::io::duplex(64);
        let (worker_read, _worker_write) = tokio::io::split(worker);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = FrameWriter::new(client_write, FrameCodec::new());
        let mut reader = FrameReader::new(worker_read, FrameCodec::new());

        let payload = Bytes::from(vec![7u8; 200]);
        let frame = Frame::new(Command::GetPackageList, 1, 0, payload.clone());
        let (written, read) = tokio::join!(writer.write_frame(frame), reader.read_frame());
        written.unwrap();
        let read = read.unwrap();
        assert_eq!(read.command, Command::GetPackageList.id());
        assert_eq!(read.payload, payload);
    }

    #[tokio::test]
    async fn closed_stream_is_peer_closed() {
        let (client, worker) = tokio::io::duplex(64);
        drop(worker);
        let mut reader = FrameReader::new(client, FrameCodec::new());
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn close_inside_a_frame_is_truncation() {
        let (client, mut worker) = tokio::io::duplex(64);
        worker.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        drop(worker);

        let mut reader = FrameReader::new(client, FrameCodec::new());
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::Truncated { buffered: 5 })
        ));
    }

    #[tokio::test]
    async fn write_to_closed_peer_fails() {
        let (client, worker) = tokio::io::duplex(64);
        drop(worker);
        let mut writer = FrameWriter::new(client, FrameCodec::new());
        let result = writer
            .write_frame(Frame::new(Command::Clean, 0, 0, Bytes::new()))
            .await;
        assert!(matches!(result, Err(TransportError::PeerClosed)));
    }
}
