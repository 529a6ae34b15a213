//! Wire protocol types for client-worker communication.
//!
//! Four channels after the handshake:
//! - **Request pipe** (client → worker) and **response pipe** (worker → client):
//!   fixed 16-byte header followed by exactly `length` payload bytes
//! - **Status pipe**: newline-delimited `pmstatus:` progress text (see [`crate::progress`])
//! - **Cancel pipe**: one zero byte per cancellation request

use std::fmt;

use bytes::Bytes;

use crate::payload::ResponseDecoder;

/// Header size: command, state, sequence and payload length as native-endian `i32`.
pub const HEADER_LEN: usize = 16;

/// State tag used by operations that do not care about package state.
pub const STATE_DEFAULT: i32 = 0;

/// State tag for operations against the temporary (uncommitted) package state.
pub const STATE_TEMP: i32 = 1;

/// Operation identifier, used both on the wire and as the pending-table index.
///
/// The numbering must match the worker build it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum Command {
    Noop = 0,
    /// Unsolicited status reports; never issued, only subscribed to.
    Status = 1,
    GetSourcesList = 2,
    SetSourcesList = 3,
    GetCatalogues = 4,
    SetCatalogues = 5,
    UpdatePackageCache = 6,
    GetPackageList = 7,
    GetPackageInfo = 8,
    GetPackageDetails = 9,
    InstallCheck = 10,
    InstallPackage = 11,
    GetPackagesToRemove = 12,
    RemovePackage = 13,
    Clean = 14,
    InstallFile = 15,
    GetFileDetails = 16,
    SaveApplicationsInstallFile = 17,
}

impl Command {
    /// Number of command kinds; one pending slot per kind.
    pub const COUNT: usize = 18;

    /// All commands in wire-id order.
    pub const ALL: [Command; Self::COUNT] = [
        Command::Noop,
        Command::Status,
        Command::GetSourcesList,
        Command::SetSourcesList,
        Command::GetCatalogues,
        Command::SetCatalogues,
        Command::UpdatePackageCache,
        Command::GetPackageList,
        Command::GetPackageInfo,
        Command::GetPackageDetails,
        Command::InstallCheck,
        Command::InstallPackage,
        Command::GetPackagesToRemove,
        Command::RemovePackage,
        Command::Clean,
        Command::InstallFile,
        Command::GetFileDetails,
        Command::SaveApplicationsInstallFile,
    ];

    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Look up a wire id. Out-of-range ids (corrupt or foreign frames) yield `None`.
    pub fn from_id(id: i32) -> Option<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }

    /// Log name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Status => "status",
            Self::GetSourcesList => "get_sources_list",
            Self::SetSourcesList => "set_sources_list",
            Self::GetCatalogues => "get_catalogues",
            Self::SetCatalogues => "set_catalogues",
            Self::UpdatePackageCache => "update_package_cache",
            Self::GetPackageList => "get_package_list",
            Self::GetPackageInfo => "get_package_info",
            Self::GetPackageDetails => "get_package_details",
            Self::InstallCheck => "install_check",
            Self::InstallPackage => "install_package",
            Self::GetPackagesToRemove => "get_packages_to_remove",
            Self::RemovePackage => "remove_package",
            Self::Clean => "clean",
            Self::InstallFile => "install_file",
            Self::GetFileDetails => "get_file_details",
            Self::SaveApplicationsInstallFile => "save_applications_install_file",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One header-plus-payload unit as it travels over the data pipes.
///
/// `command` stays a raw id here: the codec must be able to carry frames for
/// ids this client does not know, so the dispatch table can log and drop them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: i32,
    /// Caller-supplied context tag, echoed back by the worker untouched.
    pub state: i32,
    pub sequence: i32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, state: i32, sequence: i32, payload: Bytes) -> Self {
        Self {
            command: command.id(),
            state,
            sequence,
            payload,
        }
    }
}

/// A complete response routed to the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    command: Command,
    state: i32,
    sequence: i32,
    payload: Bytes,
}

impl Response {
    pub fn new(command: Command, state: i32, sequence: i32, payload: Bytes) -> Self {
        Self {
            command,
            state,
            sequence,
            payload,
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn state(&self) -> i32 {
        self.state
    }

    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decoder positioned at the start of the payload.
    pub fn decoder(&self) -> ResponseDecoder<'_> {
        ResponseDecoder::new(&self.payload)
    }
}

/// Outcome of a request: `None` means the operation did not complete
/// (worker not running, request rejected, or transport failure).
pub type Reply = Option<Response>;
