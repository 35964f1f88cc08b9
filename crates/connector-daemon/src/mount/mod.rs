//! Mount helper invocations.
//!
//! Turns init commands into the program, arguments and environment the
//! session will exec. The object-store variant also materialises its
//! credentials as a temporary config file owned by the [`Invocation`].

mod config_file;

pub use config_file::{ConfigFile, REMOTE_NAME, render as render_config};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use connector_core::config::HelperConfig;
use connector_core::protocol::{InitFilesystemMountCmd, InitObjectStoreMountCmd};
use thiserror::Error;

/// User-agent string for the helper.
pub const ENV_USER_AGENT: &str = "MOUNT_CONNECTOR_USER_AGENT";
/// Cache directory for the helper.
pub const ENV_CACHE_DIR: &str = "MOUNT_CONNECTOR_CACHE_DIR";
/// Log directory for the helper.
pub const ENV_LOG_DIR: &str = "MOUNT_CONNECTOR_LOG_DIR";
/// Temporary config file (object-store mounts only).
pub const ENV_CONFIG: &str = "MOUNT_CONNECTOR_CONFIG";

/// Errors raised while preparing a helper invocation.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("Mount target must not be empty")]
    MissingTarget,

    #[error("Value of {field} must not contain line breaks")]
    InvalidValue { field: &'static str },

    #[error("Failed to write sync tool config {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything needed to exec one mount helper.
#[derive(Debug)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Removed by the session once the helper has exited.
    pub config_file: Option<ConfigFile>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            config_file: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Resolved helper binaries.
#[derive(Debug, Clone)]
pub struct HelperBinaries {
    pub filesystem_client: PathBuf,
    pub sync_tool: PathBuf,
}

/// Directories handed to the helpers.
#[derive(Debug, Clone)]
pub struct HelperDirs {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl HelperDirs {
    pub fn from_config(helpers: &HelperConfig) -> Self {
        Self {
            config_dir: helpers.config_dir(),
            cache_dir: helpers.cache_dir(),
            log_dir: helpers.log_dir(),
        }
    }
}

/// Builds helper invocations from init commands.
///
/// Shared by every connection; holds no per-connection state.
#[derive(Debug, Clone)]
pub struct MountLauncher {
    binaries: HelperBinaries,
    dirs: HelperDirs,
    user_agent: String,
}

impl MountLauncher {
    pub const fn new(binaries: HelperBinaries, dirs: HelperDirs, user_agent: String) -> Self {
        Self {
            binaries,
            dirs,
            user_agent,
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// `<fs_client> [options...] [args...] <target>`
    pub fn filesystem(&self, cmd: &InitFilesystemMountCmd) -> Result<Invocation, MountError> {
        if cmd.target.is_empty() {
            return Err(MountError::MissingTarget);
        }

        let mut invocation = self.base_invocation(&self.binaries.filesystem_client, &self.dirs.cache_dir);
        invocation.args.extend(option_flags(&cmd.options));
        invocation.args.extend(cmd.args.iter().cloned());
        Ok(invocation.arg(cmd.target.as_str()))
    }

    /// `<sync_tool> mount <remote>:<bucket>[/<subdir>] <target> --config ... [options...]`
    ///
    /// Writes the credentials file before returning; it is deleted when the
    /// returned invocation (or the session that takes it) is done.
    pub fn object_store(&self, cmd: &InitObjectStoreMountCmd) -> Result<Invocation, MountError> {
        if cmd.target.is_empty() {
            return Err(MountError::MissingTarget);
        }
        // Validate before anything touches the disk.
        render_config(cmd)?;

        let config_dir = cmd
            .config_dir
            .as_deref()
            .map_or_else(|| self.dirs.config_dir.clone(), PathBuf::from);
        let cache_dir = cmd
            .cache_dir
            .as_deref()
            .map_or_else(|| self.dirs.cache_dir.clone(), PathBuf::from);

        let config_file = ConfigFile::write(&config_dir, cmd)?;
        let config_path = path_arg(config_file.path());
        let log_file = self.dirs.log_dir.join(format!(
            "{}.log",
            config_file
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));

        let mut invocation = self
            .base_invocation(&self.binaries.sync_tool, &cache_dir)
            .env(ENV_CONFIG, config_path.as_str())
            .arg("mount")
            .arg(remote_path(cmd))
            .arg(cmd.target.as_str())
            .arg("--config")
            .arg(config_path)
            .arg("--user-agent")
            .arg(self.user_agent.as_str())
            .arg("--cache-dir")
            .arg(path_arg(&cache_dir))
            .arg("--log-file")
            .arg(path_arg(&log_file));
        invocation.args.extend(option_flags(&cmd.options));
        invocation.config_file = Some(config_file);
        Ok(invocation)
    }

    fn base_invocation(&self, program: &Path, cache_dir: &Path) -> Invocation {
        Invocation::new(program)
            .env(ENV_USER_AGENT, self.user_agent.as_str())
            .env(ENV_CACHE_DIR, path_arg(cache_dir))
            .env(ENV_LOG_DIR, path_arg(&self.dirs.log_dir))
    }
}

fn remote_path(cmd: &InitObjectStoreMountCmd) -> String {
    let subdir = cmd.subdir.trim_matches('/');
    if subdir.is_empty() {
        format!("{REMOTE_NAME}:{}", cmd.bucket)
    } else {
        format!("{REMOTE_NAME}:{}/{subdir}", cmd.bucket)
    }
}

/// `--key=value`, or `--key` alone for an empty value, in key order.
fn option_flags(options: &BTreeMap<String, String>) -> impl Iterator<Item = String> + '_ {
    options.iter().map(|(key, value)| {
        let key = key.trim_start_matches('-');
        if value.is_empty() {
            format!("--{key}")
        } else {
            format!("--{key}={value}")
        }
    })
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn launcher(root: &Path) -> MountLauncher {
        MountLauncher::new(
            HelperBinaries {
                filesystem_client: PathBuf::from("/usr/bin/fsclient"),
                sync_tool: PathBuf::from("/usr/bin/synctool"),
            },
            HelperDirs {
                config_dir: root.join("config"),
                cache_dir: root.join("cache"),
                log_dir: root.join("log"),
            },
            "MountConnector/test".to_string(),
        )
    }

    fn env_value<'a>(invocation: &'a Invocation, key: &str) -> Option<&'a str> {
        invocation
            .env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn object_store_cmd() -> InitObjectStoreMountCmd {
        InitObjectStoreMountCmd {
            target: "/mnt/y".into(),
            bucket: "photos".into(),
            subdir: "/2024/".into(),
            access_key: "AK".into(),
            secret_key: "SK".into(),
            endpoint: "https://s3.example.com".into(),
            region: None,
            provider: Some("Qiniu".into()),
            config_dir: None,
            cache_dir: None,
            options: BTreeMap::from([("vfs-cache-mode".to_string(), "full".to_string())]),
        }
    }

    #[test]
    fn filesystem_target_comes_last() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = InitFilesystemMountCmd {
            target: "/mnt/x".into(),
            options: BTreeMap::from([
                ("ro".to_string(), String::new()),
                ("--bucket".to_string(), "b".to_string()),
            ]),
            args: vec!["mount".into()],
        };
        let launcher = launcher(dir.path());
        assert_eq!(launcher.user_agent(), "MountConnector/test");
        let invocation = launcher.filesystem(&cmd).unwrap();

        assert_eq!(invocation.program, PathBuf::from("/usr/bin/fsclient"));
        assert_eq!(invocation.args, ["--bucket=b", "--ro", "mount", "/mnt/x"]);
        assert_eq!(
            env_value(&invocation, ENV_USER_AGENT),
            Some("MountConnector/test")
        );
        assert!(env_value(&invocation, ENV_CONFIG).is_none());
        assert!(invocation.config_file.is_none());
    }

    #[test]
    fn empty_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = InitFilesystemMountCmd {
            target: String::new(),
            options: BTreeMap::new(),
            args: Vec::new(),
        };
        assert!(matches!(
            launcher(dir.path()).filesystem(&cmd),
            Err(MountError::MissingTarget)
        ));
    }

    #[test]
    fn object_store_writes_config_and_points_helper_at_it() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = launcher(dir.path()).object_store(&object_store_cmd()).unwrap();

        let config_path = invocation.config_file.as_ref().unwrap().path().to_path_buf();
        assert!(config_path.starts_with(dir.path().join("config")));
        assert!(config_path.exists());
        assert_eq!(
            env_value(&invocation, ENV_CONFIG),
            Some(config_path.to_string_lossy().as_ref())
        );

        assert_eq!(invocation.program, PathBuf::from("/usr/bin/synctool"));
        assert_eq!(invocation.args[0], "mount");
        assert_eq!(invocation.args[1], "connector:photos/2024");
        assert_eq!(invocation.args[2], "/mnt/y");
        assert!(invocation.args.contains(&"--user-agent".to_string()));
        assert_eq!(invocation.args.last().unwrap(), "--vfs-cache-mode=full");

        let contents = std::fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains("provider = Qiniu"));

        drop(invocation);
        assert!(!config_path.exists());
    }

    #[test]
    fn object_store_honours_directory_hints() {
        let dir = tempfile::tempdir().unwrap();
        let hinted = dir.path().join("hinted");
        let mut cmd = object_store_cmd();
        cmd.config_dir = Some(hinted.to_string_lossy().into_owned());
        cmd.cache_dir = Some("/var/cache/hint".into());

        let invocation = launcher(dir.path()).object_store(&cmd).unwrap();
        assert!(invocation.config_file.as_ref().unwrap().path().starts_with(&hinted));
        assert_eq!(env_value(&invocation, ENV_CACHE_DIR), Some("/var/cache/hint"));
    }

    #[test]
    fn invalid_credentials_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = object_store_cmd();
        cmd.access_key = "AK\r\n".into();

        let result = launcher(dir.path()).object_store(&cmd);
        assert!(matches!(result, Err(MountError::InvalidValue { .. })));
        assert!(!dir.path().join("config").exists());
    }
}
