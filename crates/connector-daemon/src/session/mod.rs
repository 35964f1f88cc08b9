//! Process session: the mount helper attached to one connection.
//!
//! A session spawns at most one helper. Its stdout and stderr are relayed as
//! `ResponseDataCmd`s on the connection's outbound channel, stdin is fed from
//! `RequestDataCmd`s, and a supervisor task reports the exit as a single
//! `TerminateCmd` before cancelling the connection.
//!
//! Once [`ProcessSession::close`] has run, nothing more is emitted: no further
//! output and no `TerminateCmd`.

mod relay;

pub use relay::UNKNOWN_EXIT_CODE;

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use connector_core::config::SessionConfig;
use connector_core::protocol::Command;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mount::Invocation;
use relay::{RelayContext, Supervisor, relay_output};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A mount helper is already running for this session")]
    AlreadyStarted,

    #[error("Session is closed")]
    Closed,

    #[error("No mount helper has been started")]
    NotStarted,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Mount helper {0} pipe unavailable")]
    Pipe(&'static str),

    #[error("Failed to write to helper stdin: {0}")]
    Stdin(#[source] std::io::Error),
}

/// Timing and buffer settings for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub read_buffer_bytes: usize,
    pub drain_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            read_buffer_bytes: config.read_buffer_bytes,
            drain_timeout: config.drain_timeout(),
            terminate_timeout: config.terminate_timeout(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

pub struct ProcessSession {
    id: Arc<str>,
    events: mpsc::Sender<Command>,
    options: SessionOptions,
    closed: Arc<AtomicBool>,
    /// Session-scoped; a child of `ended`.
    stop: CancellationToken,
    /// Owned by the connection; cancelled when the session has ended.
    ended: CancellationToken,
    stdin: Option<ChildStdin>,
    started: bool,
}

impl ProcessSession {
    /// `ended` is cancelled after the helper's exit has been reported.
    /// Cancelling it from outside stops the helper.
    pub fn new(
        events: mpsc::Sender<Command>,
        ended: CancellationToken,
        options: SessionOptions,
    ) -> Self {
        Self {
            id: Arc::from(uuid::Uuid::new_v4().to_string()),
            events,
            options,
            closed: Arc::new(AtomicBool::new(false)),
            stop: ended.child_token(),
            ended,
            stdin: None,
            started: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn the helper described by `invocation` and start relaying.
    ///
    /// A rejected start leaves the session as it was. The invocation's
    /// config file is removed if the helper never runs.
    pub fn start(&mut self, invocation: Invocation) -> Result<(), SessionError> {
        if self.started {
            warn!(session_id = %self.id, "Rejecting duplicate init command");
            return Err(SessionError::AlreadyStarted);
        }
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let Invocation {
            program,
            args,
            env,
            config_file,
        } = invocation;
        let program_name = program.display().to_string();

        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                program: program_name.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SessionError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SessionError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SessionError::Pipe("stderr"))?;

        info!(
            session_id = %self.id,
            program = %program_name,
            pid = child.id(),
            arg_count = args.len(),
            "Mount helper started"
        );

        let ctx = RelayContext {
            session_id: Arc::clone(&self.id),
            events: self.events.clone(),
            closed: Arc::clone(&self.closed),
            stop: self.stop.clone(),
        };
        let buffer = self.options.read_buffer_bytes;
        let relays = vec![
            tokio::spawn(relay_output(ctx.clone(), stdout, false, buffer)),
            tokio::spawn(relay_output(ctx.clone(), stderr, true, buffer)),
        ];

        let supervisor = Supervisor {
            ctx,
            child,
            relays,
            config_file,
            ended: self.ended.clone(),
            drain_timeout: self.options.drain_timeout,
            terminate_timeout: self.options.terminate_timeout,
        };
        tokio::spawn(supervisor.run());

        self.stdin = Some(stdin);
        self.started = true;
        Ok(())
    }

    /// Write `data` to the helper's stdin and flush.
    pub async fn feed_input(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(SessionError::NotStarted);
        };
        stdin.write_all(data).await.map_err(SessionError::Stdin)?;
        stdin.flush().await.map_err(SessionError::Stdin)
    }

    /// Mark the session closed, close stdin and stop the helper.
    ///
    /// Safe to call any number of times.
    pub fn close(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(session_id = %self.id, started = self.started, "Closing session");
        }
        drop(self.stdin.take());
        self.stop.cancel();
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.close();
    }
}
