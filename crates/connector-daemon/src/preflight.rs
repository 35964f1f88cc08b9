//! Startup checks for the external mount helpers.
//!
//! The daemon refuses to serve unless every helper it may need resolves to an
//! executable file.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use connector_core::config::HelperConfig;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::mount::HelperBinaries;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("{role} `{name}` not found (is it installed and on PATH?)")]
    NotFound { role: &'static str, name: String },

    #[error("Failed to run `{program} version`: {source}")]
    VersionProbe {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program} version` exited with {status}")]
    VersionStatus {
        program: String,
        status: std::process::ExitStatus,
    },

    #[error("Unrecognised `{program} version` output")]
    VersionFormat { program: String },
}

/// Version details reported by the sync tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersion {
    pub version: String,
    pub os_version: String,
    pub os_kernel: String,
}

/// Helpers resolved at startup.
#[derive(Debug, Clone)]
pub struct ResolvedHelpers {
    pub binaries: HelperBinaries,
    pub unmount_helper: PathBuf,
}

/// Resolve the filesystem client, sync tool and unmount helper.
pub fn resolve_helpers(helpers: &HelperConfig) -> Result<ResolvedHelpers, PreflightError> {
    let filesystem_client = require("filesystem client", &helpers.filesystem_client)?;
    let sync_tool = require("sync tool", &helpers.sync_tool)?;
    let unmount_helper = require("unmount helper", &helpers.unmount_helper)?;

    info!(
        filesystem_client = %filesystem_client.display(),
        sync_tool = %sync_tool.display(),
        unmount_helper = %unmount_helper.display(),
        "Mount helpers resolved"
    );

    Ok(ResolvedHelpers {
        binaries: HelperBinaries {
            filesystem_client,
            sync_tool,
        },
        unmount_helper,
    })
}

fn require(role: &'static str, name: &Path) -> Result<PathBuf, PreflightError> {
    resolve_executable(name).ok_or_else(|| PreflightError::NotFound {
        role,
        name: name.display().to_string(),
    })
}

/// Resolve `name` the way a shell would: paths are checked directly, bare
/// names are searched on `PATH`.
pub fn resolve_executable(name: &Path) -> Option<PathBuf> {
    if name.as_os_str().is_empty() {
        return None;
    }
    if name.components().count() > 1 || name.is_absolute() {
        return is_executable(name).then(|| name.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|segment| segment.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// Run `<sync_tool> version` and parse its report.
pub async fn probe_tool_version(program: &Path) -> Result<ToolVersion, PreflightError> {
    let name = program.display().to_string();
    let output = Command::new(program)
        .arg("version")
        .output()
        .await
        .map_err(|source| PreflightError::VersionProbe {
            program: name.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(PreflightError::VersionStatus {
            program: name,
            status: output.status,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!(program = %name, output = %stdout, "Sync tool version output");
    parse_tool_version(&stdout).ok_or(PreflightError::VersionFormat { program: name })
}

/// Parse output shaped like:
///
/// ```text
/// rclone v1.65.0
/// - os/version: ubuntu 22.04 (64 bit)
/// - os/kernel: 5.15.0-91-generic (x86_64)
/// ```
pub fn parse_tool_version(output: &str) -> Option<ToolVersion> {
    let mut lines = output.lines();
    let version = lines
        .next()?
        .split_whitespace()
        .nth(1)?
        .to_string();

    let mut os_version = String::new();
    let mut os_kernel = String::new();
    for line in lines {
        let line = line.trim().trim_start_matches('-').trim();
        if let Some(rest) = line.strip_prefix("os/version:") {
            os_version = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("os/kernel:") {
            os_kernel = rest.trim().to_string();
        }
    }

    Some(ToolVersion {
        version,
        os_version,
        os_kernel,
    })
}

/// `<product>/<daemon version>/<tool name>/<tool version>/<os version>/<os kernel>`
pub fn user_agent(product: &str, sync_tool: &Path, tool: &ToolVersion) -> String {
    let tool_name = sync_tool
        .file_name()
        .map_or_else(|| sync_tool.display().to_string(), |n| n.to_string_lossy().into_owned());
    format!(
        "{product}/{}/{tool_name}/{}/{}/{}",
        env!("CARGO_PKG_VERSION"),
        tool.version,
        tool.os_version,
        tool.os_kernel
    )
}
