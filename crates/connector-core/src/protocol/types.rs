//! Command payloads exchanged over the connector socket.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Wire name of [`InitFilesystemMountCmd`].
pub const INIT_FILESYSTEM_MOUNT_CMD: &str = "initFilesystemMountCmd";
/// Wire name of [`InitObjectStoreMountCmd`].
pub const INIT_OBJECT_STORE_MOUNT_CMD: &str = "initObjectStoreMountCmd";
/// Wire name of [`RequestDataCmd`].
pub const REQUEST_DATA_CMD: &str = "requestDataCmd";
/// Wire name of [`ResponseDataCmd`].
pub const RESPONSE_DATA_CMD: &str = "responseDataCmd";
/// Wire name of [`TerminateCmd`].
pub const TERMINATE_CMD: &str = "terminateCmd";

/// Which side of the socket originates a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer to daemon.
    Inbound,
    /// Daemon to peer.
    Outbound,
}

/// Every command the connector understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    InitFilesystemMount(InitFilesystemMountCmd),
    InitObjectStoreMount(InitObjectStoreMountCmd),
    RequestData(RequestDataCmd),
    ResponseData(ResponseDataCmd),
    Terminate(TerminateCmd),
}

impl Command {
    /// Canonical wire name used in the envelope's `cmd` field.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InitFilesystemMount(_) => INIT_FILESYSTEM_MOUNT_CMD,
            Self::InitObjectStoreMount(_) => INIT_OBJECT_STORE_MOUNT_CMD,
            Self::RequestData(_) => REQUEST_DATA_CMD,
            Self::ResponseData(_) => RESPONSE_DATA_CMD,
            Self::Terminate(_) => TERMINATE_CMD,
        }
    }

    pub const fn direction(&self) -> Direction {
        match self {
            Self::InitFilesystemMount(_) | Self::InitObjectStoreMount(_) | Self::RequestData(_) => {
                Direction::Inbound
            }
            Self::ResponseData(_) | Self::Terminate(_) => Direction::Outbound,
        }
    }
}

/// Mount through the user-space filesystem client.
///
/// The client is exec'd directly; no config file is materialised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitFilesystemMountCmd {
    /// Mount point.
    pub target: String,
    /// Free-form options passed through as `--key=value` flags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    /// Extra positional arguments placed before the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Mount a bucket through the cloud-storage sync tool.
///
/// Credentials are written to a temporary config file that lives for the
/// duration of the helper process.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitObjectStoreMountCmd {
    /// Mount point.
    pub target: String,
    pub bucket: String,
    /// Prefix inside the bucket to mount instead of the bucket root.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subdir: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// S3 provider name understood by the sync tool (defaults to `Other`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Directory to place the temporary config file in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<String>,
    /// Cache directory override for the sync tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

// Hand-written so that credentials never end up in log records.
impl fmt::Debug for InitObjectStoreMountCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitObjectStoreMountCmd")
            .field("target", &self.target)
            .field("bucket", &self.bucket)
            .field("subdir", &self.subdir)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("provider", &self.provider)
            .field("config_dir", &self.config_dir)
            .field("cache_dir", &self.cache_dir)
            .field("options", &self.options)
            .finish()
    }
}

/// Bytes for the helper's standard input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDataCmd {
    pub data: String,
}

/// A chunk of the helper's stdout (`is_error == false`) or stderr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDataCmd {
    pub data: String,
    pub is_error: bool,
}

/// Final event of a session carrying the helper's exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateCmd {
    pub code: i32,
}
