//! Worker status as seen by the client.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the apt-worker connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// No worker, or the last one was shut down
    #[default]
    NotStarted,
    /// Spawned, handshake in progress
    Starting,
    /// Handshake complete, requests are accepted
    Running,
    /// Transport failed; a new start is required
    Failed,
}

impl WorkerStatus {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Whether `start` may be called in this state.
    pub fn can_start(self) -> bool {
        matches!(self, Self::NotStarted | Self::Failed)
    }
}
