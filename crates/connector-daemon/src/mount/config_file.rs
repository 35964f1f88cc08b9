//! Temporary sync-tool config files holding object-store credentials.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use connector_core::protocol::InitObjectStoreMountCmd;
use tracing::{debug, warn};

use super::MountError;

/// Section name of the generated remote; referenced as `<REMOTE_NAME>:bucket`.
pub const REMOTE_NAME: &str = "connector";

const DEFAULT_PROVIDER: &str = "Other";

/// A config file that is deleted when the helper is done with it.
///
/// Call [`ConfigFile::remove`] to observe the result; dropping the guard
/// removes the file as well and only logs failures.
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    removed: bool,
}

impl ConfigFile {
    /// Write the remote definition for `cmd` as `<dir>/<uuid>.conf` (mode 0600).
    pub fn write(dir: &Path, cmd: &InitObjectStoreMountCmd) -> Result<Self, MountError> {
        let contents = render(cmd)?;

        std::fs::create_dir_all(dir).map_err(|source| MountError::ConfigWrite {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!("{}.conf", uuid::Uuid::new_v4()));

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()
        };
        if let Err(source) = write() {
            let _ = std::fs::remove_file(&path);
            return Err(MountError::ConfigWrite { path, source });
        }

        debug!(path = %path.display(), "Wrote sync tool config");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. A file that is already gone counts as removed.
    pub fn remove(mut self) -> std::io::Result<()> {
        self.removed = true;
        remove_if_present(&self.path)
    }
}

impl Drop for ConfigFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = remove_if_present(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove sync tool config");
        }
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Render the INI remote section for an object-store mount.
pub fn render(cmd: &InitObjectStoreMountCmd) -> Result<String, MountError> {
    let provider = cmd.provider.as_deref().unwrap_or(DEFAULT_PROVIDER);
    let mut entries = vec![
        ("type", "s3"),
        ("provider", provider),
        ("access_key_id", cmd.access_key.as_str()),
        ("secret_access_key", cmd.secret_key.as_str()),
        ("endpoint", cmd.endpoint.as_str()),
    ];
    if let Some(region) = cmd.region.as_deref() {
        entries.push(("region", region));
    }

    let mut out = format!("[{REMOTE_NAME}]\n");
    for (key, value) in entries {
        if value.contains(['\n', '\r']) {
            return Err(MountError::InvalidValue { field: key });
        }
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}
