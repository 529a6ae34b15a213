//! Capabilities the client consumes from the host application.
//!
//! The GUI owns user notification, progress display, network bring-up and
//! proxy configuration. The client only calls into them through these traits,
//! so tests (and headless hosts) can substitute their own.

use std::sync::Arc;

use async_trait::async_trait;

use crate::progress::ProgressUpdate;

/// Message identifiers handed to the host. The host translates them.
pub mod messages {
    pub const OPERATION_FAILED: &str = "ai_ni_operation_failed";
    pub const UPDATE_LIST_NOT_SUCCESSFUL: &str = "ai_ni_update_list_not_successful";
    pub const UPDATING_LIST: &str = "ai_nw_updating_list";
    pub const UPDATING: &str = "ai_nw_updating";
    pub const INSTALLING: &str = "ai_nw_installing";
}

/// User-visible failure notification.
pub trait UserNotifier: Send + Sync {
    /// Tell the user something went wrong and point them at the log.
    fn annoy_user_with_log(&self, message: &str);
}

/// General progress indicator.
pub trait ProgressSink: Send + Sync {
    /// One parsed record from the worker's status stream.
    fn set_progress(&self, update: &ProgressUpdate);

    /// Show an indeterminate progress indicator with a title.
    fn show_progress(&self, title: &str);

    fn set_general_title(&self, title: &str);

    /// Clear the "user pressed cancel" flag before a new long operation.
    fn reset_cancelled(&self);
}

/// Network-readiness gate consulted before operations that download.
#[async_trait]
pub trait NetworkGate: Send + Sync {
    /// Bring the network up if needed. `false` means the operation must not proceed.
    async fn ensure_network(&self) -> bool;
}

/// Proxy settings forwarded to the worker with download requests.
pub trait ProxySource: Send + Sync {
    fn http_proxy(&self) -> Option<String>;
    fn https_proxy(&self) -> Option<String>;
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl UserNotifier for LogNotifier {
    fn annoy_user_with_log(&self, message: &str) {
        tracing::error!(notification = message, "User notification");
    }
}

/// Progress sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn set_progress(&self, update: &ProgressUpdate) {
        tracing::debug!(percent = update.percent, label = %update.label, "Progress");
    }

    fn show_progress(&self, title: &str) {
        tracing::info!(title, "Progress started");
    }

    fn set_general_title(&self, title: &str) {
        tracing::debug!(title, "Progress title");
    }

    fn reset_cancelled(&self) {}
}

/// Gate for hosts without network management.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

#[async_trait]
impl NetworkGate for AlwaysOnline {
    async fn ensure_network(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxy;

impl ProxySource for NoProxy {
    fn http_proxy(&self) -> Option<String> {
        None
    }

    fn https_proxy(&self) -> Option<String> {
        None
    }
}

/// Bundle of host capabilities shared by the client and its tasks.
#[derive(Clone)]
pub struct Host {
    pub notifier: Arc<dyn UserNotifier>,
    pub progress: Arc<dyn ProgressSink>,
    pub network: Arc<dyn NetworkGate>,
    pub proxy: Arc<dyn ProxySource>,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LogNotifier),
            progress: Arc::new(LogProgress),
            network: Arc::new(AlwaysOnline),
            proxy: Arc::new(NoProxy),
        }
    }
}

impl Host {
    pub fn with_notifier(mut self, notifier: Arc<dyn UserNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkGate>) -> Self {
        self.network = network;
        self
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ProxySource>) -> Self {
        self.proxy = proxy;
        self
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}
