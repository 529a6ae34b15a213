//! Typed apt-worker operations.
//!
//! Each wrapper encodes its parameters and issues one request. Cache updates
//! and package installs first wait for the network gate, and forward the
//! host's proxy settings to the worker.

use bytes::Bytes;

use crate::bridge::protocol::{Command, Reply, STATE_DEFAULT};
use crate::client::{PendingReply, WorkerClient};
use crate::host::{ProxySource, messages};
use crate::payload::RequestEncoder;

/// Selection for [`WorkerClient::get_package_list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageListFilter {
    /// Only packages in user-visible sections.
    pub only_user: bool,
    pub only_installed: bool,
    pub only_available: bool,
    /// Name pattern; `None` matches everything.
    pub pattern: Option<String>,
    /// Include the operating system meta package.
    pub show_magic_sys: bool,
}

fn encode_proxies(enc: &mut RequestEncoder, proxy: &dyn ProxySource) {
    enc.encode_string(proxy.http_proxy().as_deref());
    enc.encode_string(proxy.https_proxy().as_deref());
}

impl WorkerClient {
    pub fn get_package_list(&self, state: i32, filter: &PackageListFilter) -> PendingReply {
        let mut enc = RequestEncoder::new();
        enc.encode_bool(filter.only_user)
            .encode_bool(filter.only_installed)
            .encode_bool(filter.only_available)
            .encode_string(filter.pattern.as_deref())
            .encode_bool(filter.show_magic_sys);
        self.issue(Command::GetPackageList, state, enc.finish())
    }

    /// Refresh the package cache once the network is up.
    ///
    /// Without network the worker is never contacted: the user is told the
    /// update failed and the reply is `None`.
    pub async fn update_cache(&self, state: i32) -> Reply {
        let host = self.host().clone();
        if !host.network.ensure_network().await {
            tracing::info!("Network unavailable, not updating package cache");
            host.notifier
                .annoy_user_with_log(messages::UPDATE_LIST_NOT_SUCCESSFUL);
            return None;
        }

        let mut enc = RequestEncoder::new();
        encode_proxies(&mut enc, host.proxy.as_ref());
        host.progress.show_progress(messages::UPDATING_LIST);
        self.issue(Command::UpdatePackageCache, state, enc.finish())
            .await
    }

    pub fn get_sources_list(&self) -> PendingReply {
        self.issue(Command::GetSourcesList, STATE_DEFAULT, Bytes::new())
    }

    /// The sources list format is owned by the caller, which writes it into the encoder.
    pub fn set_sources_list<F>(&self, state: i32, encode: F) -> PendingReply
    where
        F: FnOnce(&mut RequestEncoder),
    {
        let mut enc = RequestEncoder::new();
        encode(&mut enc);
        self.issue(Command::SetSourcesList, state, enc.finish())
    }

    pub fn get_catalogues(&self) -> PendingReply {
        self.issue(Command::GetCatalogues, STATE_DEFAULT, Bytes::new())
    }

    pub fn set_catalogues<F>(&self, state: i32, encode: F) -> PendingReply
    where
        F: FnOnce(&mut RequestEncoder),
    {
        let mut enc = RequestEncoder::new();
        encode(&mut enc);
        self.issue(Command::SetCatalogues, state, enc.finish())
    }

    pub fn get_package_info(
        &self,
        state: i32,
        package: &str,
        only_installable_info: bool,
    ) -> PendingReply {
        let mut enc = RequestEncoder::new();
        enc.encode_string(Some(package))
            .encode_bool(only_installable_info);
        self.issue(Command::GetPackageInfo, state, enc.finish())
    }

    pub fn get_package_details(
        &self,
        package: &str,
        version: &str,
        summary_kind: i32,
    ) -> PendingReply {
        let mut enc = RequestEncoder::new();
        enc.encode_string(Some(package))
            .encode_string(Some(version))
            .encode_int(summary_kind);
        self.issue(Command::GetPackageDetails, STATE_DEFAULT, enc.finish())
    }

    pub fn install_check(&self, state: i32, package: &str) -> PendingReply {
        let mut enc = RequestEncoder::new();
        enc.encode_string(Some(package));
        self.issue(Command::InstallCheck, state, enc.finish())
    }

    /// Install (or update, when `updating`) a package once the network is up.
    pub async fn install_package(&self, state: i32, package: &str, updating: bool) -> Reply {
        let package = package.to_owned();
        let host = self.host().clone();
        if !host.network.ensure_network().await {
            tracing::info!(%package, "Network unavailable, not installing");
            return None;
        }

        let mut enc = RequestEncoder::new();
        enc.encode_string(Some(package.as_str()));
        encode_proxies(&mut enc, host.proxy.as_ref());

        host.progress.set_general_title(if updating {
            messages::UPDATING
        } else {
            messages::INSTALLING
        });
        host.progress.reset_cancelled();

        self.issue(Command::InstallPackage, state, enc.finish())
            .await
    }

    pub fn get_packages_to_remove(&self, package: &str) -> PendingReply {
        let mut enc = RequestEncoder::new();
        enc.encode_string(Some(package));
        self.issue(Command::GetPackagesToRemove, STATE_DEFAULT, enc.finish())
    }

    pub fn remove_package(&self, package: &str) -> PendingReply {
        let mut enc = RequestEncoder::new();
        enc.encode_string(Some(package));
        self.issue(Command::RemovePackage, STATE_DEFAULT, enc.finish())
    }

    pub fn clean(&self, state: i32) -> PendingReply {
        self.issue(Command::Clean, state, Bytes::new())
    }

    pub fn install_file(&self, file: &str) -> PendingReply {
        let mut enc = RequestEncoder::new();
        enc.encode_string(Some(file));
        self.issue(Command::InstallFile, STATE_DEFAULT, enc.finish())
    }

    pub fn get_file_details(&self, only_user: bool, file: &str) -> PendingReply {
        let mut enc = RequestEncoder::new();
        enc.encode_bool(only_user).encode_string(Some(file));
        self.issue(Command::GetFileDetails, STATE_DEFAULT, enc.finish())
    }

    pub fn save_applications_install_file(&self) -> PendingReply {
        self.issue(
            Command::SaveApplicationsInstallFile,
            STATE_DEFAULT,
            Bytes::new(),
        )
    }
}
