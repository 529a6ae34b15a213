//! apt-worker-client: client transport for the privileged apt-worker process.
//!
//! The worker runs as root under sudo and talks to its client over four
//! named pipes: requests, responses, a progress text stream and a cancel
//! signal. This crate spawns it, performs the ordered handshake, routes each
//! response to the request that caused it, and turns any transport failure
//! into null replies instead of errors.

pub mod bridge;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod host;
pub mod lifecycle;
pub mod logging;
mod operations;
pub mod payload;
pub mod progress;
mod session;
mod status;

#[cfg(test)]
mod test_support;

pub use bridge::protocol::{Command, Reply, Response, STATE_DEFAULT, STATE_TEMP};
pub use client::{PendingReply, StartupHandle, WorkerClient};
pub use config::ClientConfig;
pub use host::{Host, NetworkGate, ProgressSink, ProxySource, UserNotifier};
pub use lifecycle::{SpawnError, StartupError, WorkerCommand, WorkerSpawner, WrapperSpawner};
pub use logging::init_tracing;
pub use operations::PackageListFilter;
pub use payload::{RequestEncoder, ResponseDecoder};
pub use progress::ProgressUpdate;
pub use status::WorkerStatus;
