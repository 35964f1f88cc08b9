//! Background tasks of a running session: output relays and the exit supervisor.

use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use connector_core::protocol::{Command, ResponseDataCmd, TerminateCmd};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mount::ConfigFile;

/// Exit code reported when the helper died by signal or could not be waited on.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Shared between the session and its tasks.
#[derive(Clone)]
pub(super) struct RelayContext {
    pub session_id: Arc<str>,
    pub events: mpsc::Sender<Command>,
    pub closed: Arc<AtomicBool>,
    pub stop: CancellationToken,
}

/// Forward one output stream as `ResponseDataCmd`s until EOF or stop.
pub(super) async fn relay_output<R>(
    ctx: RelayContext,
    mut reader: R,
    is_error: bool,
    buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let stream = if is_error { "stderr" } else { "stdout" };
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let n = tokio::select! {
            () = ctx.stop.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(session_id = %ctx.session_id, stream, error = %e, "Failed to read helper output");
                    break;
                }
            },
        };

        // Lossy tail: whatever was read after close is dropped.
        if ctx.closed.load(Ordering::Acquire) {
            break;
        }

        let event = Command::ResponseData(ResponseDataCmd {
            data: String::from_utf8_lossy(&buf[..n]).into_owned(),
            is_error,
        });
        tokio::select! {
            () = ctx.stop.cancelled() => break,
            sent = ctx.events.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!(session_id = %ctx.session_id, stream, "Output relay finished");
}

/// Owns the child after spawn and reports its exit.
pub(super) struct Supervisor {
    pub ctx: RelayContext,
    pub child: Child,
    pub relays: Vec<JoinHandle<()>>,
    pub config_file: Option<ConfigFile>,
    /// Cancelled once the session has ended, whatever the reason.
    pub ended: CancellationToken,
    pub drain_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl Supervisor {
    pub async fn run(mut self) {
        let session_id = Arc::clone(&self.ctx.session_id);

        let exited = tokio::select! {
            status = self.child.wait() => Some(status),
            () = self.ctx.stop.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status,
            None => {
                // Cancelled sessions never report a TerminateCmd.
                self.ctx.closed.store(true, Ordering::Release);
                terminate_child(&mut self.child, self.terminate_timeout, &session_id).await
            }
        };

        let code = match &status {
            Ok(status) => {
                if let Some(signal) = status.signal() {
                    info!(%session_id, signal, "Mount helper killed by signal");
                }
                status.code().unwrap_or(UNKNOWN_EXIT_CODE)
            }
            Err(e) => {
                warn!(%session_id, error = %e, "Failed to wait for mount helper");
                UNKNOWN_EXIT_CODE
            }
        };

        self.drain_relays().await;

        if self.ctx.closed.load(Ordering::Acquire) {
            debug!(%session_id, code, "Session closed before helper exit, not reporting");
        } else {
            info!(%session_id, exit_code = code, "Mount helper exited");
            if self
                .ctx
                .events
                .send(Command::Terminate(TerminateCmd { code }))
                .await
                .is_err()
            {
                debug!(%session_id, "Outbound channel gone before TerminateCmd");
            }
        }

        if let Some(config_file) = self.config_file.take() {
            let path = config_file.path().to_path_buf();
            match config_file.remove() {
                Ok(()) => debug!(%session_id, path = %path.display(), "Removed sync tool config"),
                Err(e) => warn!(
                    %session_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove sync tool config"
                ),
            }
        }

        self.ctx.closed.store(true, Ordering::Release);
        self.ended.cancel();
    }

    /// Wait for both relays to hit EOF so TerminateCmd is the last event.
    async fn drain_relays(&mut self) {
        let deadline = Instant::now() + self.drain_timeout;
        for mut relay in std::mem::take(&mut self.relays) {
            if tokio::time::timeout_at(deadline, &mut relay).await.is_err() {
                debug!(session_id = %self.ctx.session_id, "Output still open after helper exit, stopping relays");
                self.ctx.stop.cancel();
                let _ = relay.await;
            }
        }
    }
}

/// SIGTERM, then SIGKILL once `grace` has elapsed.
async fn terminate_child(
    child: &mut Child,
    grace: Duration,
    session_id: &str,
) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        // SAFETY: pid is a valid process ID obtained from our own Child handle,
        // which has not been reaped yet. kill(2) has no memory-safety requirements.
        #[allow(unsafe_code)]
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!(session_id, pid, error = %err, "Failed to send SIGTERM");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(session_id, "Timeout waiting for helper to stop, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}
