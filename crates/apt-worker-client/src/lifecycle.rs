//! Worker lifecycle: spawn apt-worker and rendezvous on its four FIFOs.
//!
//! Flow:
//! 1. Recreate the FIFOs
//! 2. Spawn the worker under sudo (or fakeroot inside the build sandbox)
//! 3. Open the FIFOs in the worker's order, retrying every `retry_interval`
//! 4. On success: unlink the FIFO paths, forward worker output to tracing
//! 5. On timeout or cancellation: close partial opens, kill the worker

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bridge::transport::{Rendezvous, WorkerChannels};
use crate::config::ClientConfig;

/// Option flag telling the worker to break stale package-manager locks.
pub const BREAK_LOCKS_OPTION: &str = "B";

/// Full command line for one worker launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    /// `<wrapper> <worker> <to> <from> <status> <cancel> <options>`
    pub fn build(config: &ClientConfig) -> Self {
        let program = if config.sandbox_marker.exists() {
            config.sandbox_wrapper.clone()
        } else {
            config.privileged_wrapper.clone()
        };

        let mut args = Vec::with_capacity(6);
        args.push(config.worker_executable.clone().into_os_string());
        for path in config.pipes.in_order() {
            args.push(path.as_os_str().to_owned());
        }
        let options = if config.break_locks {
            BREAK_LOCKS_OPTION
        } else {
            ""
        };
        args.push(OsString::from(options));

        Self { program, args }
    }

    /// Program and arguments as display strings.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for how the worker process is started.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Runs the command as built, with stdout/stderr captured for logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct WrapperSpawner;

impl WorkerSpawner for WrapperSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: command.program.display().to_string(),
                source,
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("apt-worker is already starting or running")]
    AlreadyRunning,
    #[error("failed to create fifo {}: {source}", path.display())]
    Fifo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("apt-worker did not open its channels within {0:?}")]
    Timeout(Duration),
    #[error("startup cancelled")]
    Cancelled,
    #[error("startup failed: {0}")]
    Internal(String),
}

/// A spawned worker with all four channels open.
#[derive(Debug)]
pub struct LaunchedWorker {
    pub child: Child,
    pub channels: WorkerChannels,
}

/// Spawn the worker and complete the handshake.
///
/// `on_tick` runs once per retry interval while waiting.
pub async fn launch<F>(
    config: &ClientConfig,
    cancel: &CancellationToken,
    on_tick: F,
) -> Result<LaunchedWorker, StartupError>
where
    F: FnMut(),
{
    config
        .pipes
        .create_fifos()
        .map_err(|(path, source)| StartupError::Fifo { path, source })?;

    let command = WorkerCommand::build(config);
    tracing::info!(argv = ?command.argv(), "Spawning apt-worker");
    let mut child = config.spawner.spawn(&command)?;

    let rendezvous = Rendezvous::new(config.pipes.clone());
    match handshake(
        rendezvous,
        config.retry_interval,
        config.start_timeout,
        cancel,
        on_tick,
    )
    .await
    {
        Ok(channels) => {
            config.pipes.remove();
            forward_output(&mut child);
            tracing::info!(pid = ?child.id(), "apt-worker started");
            Ok(LaunchedWorker { child, channels })
        }
        Err(e) => {
            if let Err(kill_err) = child.start_kill() {
                tracing::debug!(error = %kill_err, "Could not kill apt-worker after failed startup");
            }
            Err(e)
        }
    }
}

/// Drive the rendezvous until all four channels are open.
///
/// One attempt runs immediately; after that one attempt per interval. The
/// handshake fails once the accumulated wait exceeds `timeout`. Dropping the
/// rendezvous on failure closes whatever was opened.
pub(crate) async fn handshake<F>(
    mut rendezvous: Rendezvous,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut on_tick: F,
) -> Result<WorkerChannels, StartupError>
where
    F: FnMut(),
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut waited = Duration::ZERO;

    if !rendezvous.advance() {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(step = ?rendezvous.step(), "apt-worker startup cancelled");
                    return Err(StartupError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            if rendezvous.advance() {
                break;
            }

            waited += interval;
            if waited > timeout {
                tracing::warn!(
                    step = ?rendezvous.step(),
                    waited_ms = waited.as_millis() as u64,
                    "apt-worker handshake timed out"
                );
                return Err(StartupError::Timeout(timeout));
            }
            on_tick();
        }
    }

    rendezvous
        .into_channels()
        .ok_or_else(|| StartupError::Internal("handshake finished without all channels".into()))
}

#[derive(Debug, Clone, Copy)]
enum LogSource {
    Stdout,
    Stderr,
}

/// Forward the worker's stdout/stderr, line by line, to the `apt_worker` target.
fn forward_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, LogSource::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, LogSource::Stderr));
    }
}

async fn forward_lines<R>(reader: R, source: LogSource)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    tracing::info!(target: "apt_worker", source = ?source, "{}", trimmed);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(source = ?source, error = %e, "Worker output stream failed");
                break;
            }
        }
    }
    tracing::trace!(source = ?source, "Worker output stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::{HandshakeStep, PipePaths};
    use crate::test_support::{FakeSpawner, FakeWorker};
    use std::sync::Arc;
    use tokio::net::unix::pipe;

    fn test_config(marker: PathBuf) -> ClientConfig {
        ClientConfig::new("/usr/libexec/apt-worker").with_sandbox_marker(marker)
    }

    #[test]
    fn command_uses_sudo_outside_sandbox() {
        let config = test_config(PathBuf::from("/nonexistent/scratchbox.config"));
        insta::assert_json_snapshot!("worker_argv_sudo", WorkerCommand::build(&config).argv());
    }

    #[test]
    fn command_uses_fakeroot_inside_sandbox_and_breaks_locks() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let config = test_config(marker.path().to_path_buf()).with_break_locks(true);
        insta::assert_json_snapshot!(
            "worker_argv_fakeroot_break_locks",
            WorkerCommand::build(&config).argv()
        );
    }

    #[tokio::test]
    async fn handshake_times_out_and_closes_partial_opens() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PipePaths::in_dir(dir.path());
        paths.create_fifos().unwrap();

        // The worker opens its request end and stops there.
        let _worker_requests = pipe::OpenOptions::new()
            .open_receiver(&paths.to_worker)
            .unwrap();

        let mut ticks = 0;
        let result = handshake(
            Rendezvous::new(paths.clone()),
            Duration::from_millis(5),
            Duration::from_millis(30),
            &CancellationToken::new(),
            || ticks += 1,
        )
        .await;

        assert!(matches!(result, Err(StartupError::Timeout(_))));
        assert!(ticks >= 5, "expected a tick per retry, got {ticks}");

        // The client's read end of the response pipe was released: a writer
        // can no longer attach.
        let err = pipe::OpenOptions::new()
            .open_sender(&paths.from_worker)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(nix::errno::Errno::ENXIO as i32));
    }

    #[tokio::test]
    async fn handshake_can_be_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PipePaths::in_dir(dir.path());
        paths.create_fifos().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = handshake(
            Rendezvous::new(paths),
            Duration::from_millis(5),
            Duration::from_secs(5),
            &token,
            || {},
        )
        .await;
        assert!(matches!(result, Err(StartupError::Cancelled)));
    }

    #[tokio::test]
    async fn handshake_completes_once_worker_connects() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PipePaths::in_dir(dir.path());
        paths.create_fifos().unwrap();

        let mut rendezvous = Rendezvous::new(paths.clone());
        assert!(!rendezvous.advance());
        assert_eq!(rendezvous.step(), HandshakeStep::ToWorker);

        let worker = tokio::spawn(FakeWorker::connect(paths.clone()));
        let channels = handshake(
            rendezvous,
            Duration::from_millis(5),
            Duration::from_secs(5),
            &CancellationToken::new(),
            || {},
        )
        .await;
        assert!(channels.is_ok());
        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn launch_removes_fifo_paths_after_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PipePaths::in_dir(dir.path());
        let spawner = Arc::new(FakeSpawner::new());
        let config = test_config(PathBuf::from("/nonexistent/scratchbox.config"))
            .with_pipes(paths.clone())
            .with_retry_interval(Duration::from_millis(5))
            .with_spawner(spawner.clone());

        let launched = launch(&config, &CancellationToken::new(), || {}).await;
        assert!(launched.is_ok());
        for path in paths.in_order() {
            assert!(!path.exists(), "{} still exists", path.display());
        }
        assert!(spawner.take_worker().await.is_some());
    }

    #[tokio::test]
    async fn launch_reports_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(PathBuf::from("/nonexistent/scratchbox.config"))
            .with_pipes(PipePaths::in_dir(dir.path()))
            .with_privileged_wrapper(dir.path().join("no-such-wrapper"));

        let result = launch(&config, &CancellationToken::new(), || {}).await;
        assert!(matches!(result, Err(StartupError::Spawn(_))));
    }
}
