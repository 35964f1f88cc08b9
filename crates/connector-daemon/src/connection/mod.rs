//! Per-connection command handling.
//!
//! Each accepted socket runs three cooperating tasks:
//!
//! - the inbound reader (the handler's own task) frames lines, decodes them
//!   and pushes commands to the dispatcher;
//! - the dispatcher owns the [`ProcessSession`] and executes commands;
//! - the outbound writer encodes session events back onto the socket.
//!
//! Every read and write is bounded by the connection's fixed deadline.

use std::sync::Arc;

use connector_core::protocol::{self, Command, ProtocolError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::StreamExt as _;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::mount::{MountError, MountLauncher};
use crate::session::{ProcessSession, SessionError, SessionOptions};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Request line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("Socket read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("Socket write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("Connection deadline expired")]
    DeadlineExpired,

    #[error("Peer sent {command}, which only the daemon may send")]
    UnexpectedCommand { command: &'static str },

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Connection {task} task failed: {source}")]
    TaskFailed {
        task: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Limits applied to a single connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Absolute; every socket read and write fails after it.
    pub deadline: Instant,
    pub max_line_bytes: usize,
    pub channel_capacity: usize,
}

pub struct ConnectionHandler {
    id: String,
    launcher: Arc<MountLauncher>,
    limits: ConnectionLimits,
    session_options: SessionOptions,
    cancel: CancellationToken,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionHandler {
    /// `cancel` tears the connection down when fired from outside.
    pub fn new(
        launcher: Arc<MountLauncher>,
        limits: ConnectionLimits,
        session_options: SessionOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Open);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            launcher,
            limits,
            session_options,
            cancel,
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Serve `stream` until the connection is torn down.
    ///
    /// Returns the error that caused the teardown, if any. A peer hangup or a
    /// helper that ran to completion is a clean close.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn run(self, stream: UnixStream) -> Result<(), ConnectionError> {
        let (read_half, write_half) = stream.into_split();
        let capacity = self.limits.channel_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        let session = ProcessSession::new(outbound_tx, self.cancel.clone(), self.session_options);
        debug!(session_id = %session.id(), "Connection opened");

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&self.launcher),
            session,
            inbound_rx,
            self.limits.deadline,
            self.cancel.clone(),
        )
        .in_current_span());
        let writer = tokio::spawn(write_outbound(
            write_half,
            outbound_rx,
            self.limits.deadline,
            self.cancel.clone(),
        )
        .in_current_span());

        let read_result = self.read_inbound(read_half, inbound_tx).await;
        self.state.send_modify(|state| *state = ConnectionState::Closing);
        self.cancel.cancel();

        let dispatch_result = join_task(dispatcher, "dispatcher").await;
        let write_result = join_task(writer, "writer").await;
        self.state.send_modify(|state| *state = ConnectionState::Closed);

        let result = read_result.and(dispatch_result).and(write_result);
        match &result {
            Ok(()) => info!("Connection closed"),
            Err(e) => warn!(error = %e, "Connection torn down"),
        }
        result
    }

    async fn read_inbound(
        &self,
        read_half: OwnedReadHalf,
        inbound: mpsc::Sender<Command>,
    ) -> Result<(), ConnectionError> {
        let max = self.limits.max_line_bytes;
        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(max));

        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                next = tokio::time::timeout_at(self.limits.deadline, lines.next()) => next,
            };
            let line = match next {
                Err(_) => return Err(ConnectionError::DeadlineExpired),
                Ok(None) => {
                    debug!("Peer closed connection");
                    return Ok(());
                }
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    return Err(ConnectionError::LineTooLong { max });
                }
                Ok(Some(Err(LinesCodecError::Io(e)))) => return Err(ConnectionError::Read(e)),
                Ok(Some(Ok(line))) => line,
            };

            let command = protocol::decode(&line)?;
            debug!(cmd = command.name(), "Received command");
            // A stalled dispatcher must not hold the reader past the deadline.
            let sent = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                sent = tokio::time::timeout_at(self.limits.deadline, inbound.send(command)) => sent,
            };
            match sent {
                Err(_) => return Err(ConnectionError::DeadlineExpired),
                Ok(Err(_)) => return Ok(()),
                Ok(Ok(())) => {}
            }
        }
    }
}

async fn join_task(
    handle: tokio::task::JoinHandle<Result<(), ConnectionError>>,
    task: &'static str,
) -> Result<(), ConnectionError> {
    handle.await.unwrap_or_else(|source| {
        error!(task, error = %source, "Connection task failed");
        Err(ConnectionError::TaskFailed { task, source })
    })
}

async fn dispatch(
    launcher: Arc<MountLauncher>,
    mut session: ProcessSession,
    mut inbound: mpsc::Receiver<Command>,
    deadline: Instant,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let result = loop {
        let command = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            command = inbound.recv() => match command {
                Some(command) => command,
                None => break Ok(()),
            },
        };
        if let Err(e) = handle_command(&launcher, &mut session, command, deadline, &cancel).await {
            break Err(e);
        }
    };

    session.close();
    if result.is_err() {
        cancel.cancel();
    }
    result
}

async fn handle_command(
    launcher: &MountLauncher,
    session: &mut ProcessSession,
    command: Command,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    match command {
        Command::InitFilesystemMount(cmd) => {
            ensure_idle(session)?;
            info!(
                session_id = %session.id(),
                target = %cmd.target,
                user_agent = launcher.user_agent(),
                "Filesystem mount requested"
            );
            let invocation = launcher.filesystem(&cmd)?;
            session.start(invocation)?;
        }
        Command::InitObjectStoreMount(cmd) => {
            // Checked before the credentials file is written.
            ensure_idle(session)?;
            info!(
                session_id = %session.id(),
                bucket = %cmd.bucket,
                target = %cmd.target,
                user_agent = launcher.user_agent(),
                "Object store mount requested"
            );
            let invocation = launcher.object_store(&cmd)?;
            session.start(invocation)?;
        }
        Command::RequestData(cmd) => {
            let fed = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                fed = tokio::time::timeout_at(deadline, session.feed_input(cmd.data.as_bytes())) => fed,
            };
            let Ok(fed) = fed else {
                warn!(session_id = %session.id(), "Helper stdin still blocked at deadline");
                return Err(ConnectionError::DeadlineExpired);
            };
            match fed {
                Ok(()) => {}
                Err(SessionError::Stdin(e)) => {
                    warn!(session_id = %session.id(), error = %e, "Failed to forward data to helper");
                }
                Err(SessionError::Closed) => {
                    debug!(session_id = %session.id(), "Dropping data for finished session");
                }
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "Data received before init");
                    return Err(e.into());
                }
            }
        }
        Command::ResponseData(_) | Command::Terminate(_) => {
            return Err(ConnectionError::UnexpectedCommand {
                command: command.name(),
            });
        }
    }
    Ok(())
}

fn ensure_idle(session: &ProcessSession) -> Result<(), SessionError> {
    if session.is_started() {
        warn!(session_id = %session.id(), "Rejecting duplicate init command");
        return Err(SessionError::AlreadyStarted);
    }
    Ok(())
}

/// Drains `outbound` until every sender is gone, then shuts the write half.
async fn write_outbound(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Command>,
    deadline: Instant,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let result = write_commands(&mut writer, &mut outbound, deadline).await;

    if result.is_err() {
        cancel.cancel();
    }
    drop(outbound);
    if let Ok(Err(e)) = tokio::time::timeout_at(deadline, writer.shutdown()).await {
        debug!(error = %e, "Failed to shut down socket write half");
    }
    result
}

async fn write_commands(
    writer: &mut OwnedWriteHalf,
    outbound: &mut mpsc::Receiver<Command>,
    deadline: Instant,
) -> Result<(), ConnectionError> {
    while let Some(command) = outbound.recv().await {
        let bytes = protocol::encode(&command)?;
        tokio::time::timeout_at(deadline, writer.write_all(&bytes))
            .await
            .map_err(|_| ConnectionError::DeadlineExpired)?
            .map_err(ConnectionError::Write)?;
        debug!(cmd = command.name(), "Sent command");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use connector_core::protocol::{InitFilesystemMountCmd, RequestDataCmd, TerminateCmd};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use crate::mount::{HelperBinaries, HelperDirs};

    const WAIT: Duration = Duration::from_secs(10);

    fn launcher(root: &Path) -> Arc<MountLauncher> {
        Arc::new(MountLauncher::new(
            HelperBinaries {
                filesystem_client: PathBuf::from("/bin/sh"),
                sync_tool: PathBuf::from("/bin/sh"),
            },
            HelperDirs {
                config_dir: root.join("config"),
                cache_dir: root.join("cache"),
                log_dir: root.join("log"),
            },
            "MountConnector/test".to_string(),
        ))
    }

    type Started = (
        UnixStream,
        tokio::task::JoinHandle<Result<(), ConnectionError>>,
        watch::Receiver<ConnectionState>,
    );

    fn start(root: &Path, lifetime: Duration) -> Started {
        start_with_line_limit(root, lifetime, 1024)
    }

    fn start_with_line_limit(root: &Path, lifetime: Duration, max_line_bytes: usize) -> Started {
        let (client, server) = UnixStream::pair().unwrap();
        let handler = ConnectionHandler::new(
            launcher(root),
            ConnectionLimits {
                deadline: Instant::now() + lifetime,
                max_line_bytes,
                channel_capacity: 8,
            },
            SessionOptions::default(),
            CancellationToken::new(),
        );
        let state = handler.state();
        (client, tokio::spawn(handler.run(server)), state)
    }

    fn line(command: &Command) -> Vec<u8> {
        protocol::encode(command).unwrap()
    }

    fn shell_mount(script: &str) -> Command {
        Command::InitFilesystemMount(InitFilesystemMountCmd {
            target: "/mnt/x".into(),
            options: Default::default(),
            args: vec!["-c".into(), script.into()],
        })
    }

    async fn read_all(client: UnixStream) -> Vec<Command> {
        let mut lines = BufReader::new(client).lines();
        let mut out = Vec::new();
        while let Some(line) = tokio::time::timeout(WAIT, lines.next_line())
            .await
            .unwrap()
            .unwrap()
        {
            out.push(protocol::decode(&line).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn helper_output_then_terminate_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle, state) = start(dir.path(), WAIT);

        client
            .write_all(&line(&shell_mount("printf ok; exit 0")))
            .await
            .unwrap();

        let events = read_all(client).await;
        assert_eq!(
            events.last(),
            Some(&Command::Terminate(TerminateCmd { code: 0 }))
        );
        assert!(events[..events.len() - 1]
            .iter()
            .all(|e| matches!(e, Command::ResponseData(_))));

        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn data_is_written_to_helper_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle, _state) = start(dir.path(), WAIT);

        client
            .write_all(&line(&shell_mount("read l; printf \"[$l]\"")))
            .await
            .unwrap();
        client
            .write_all(&line(&Command::RequestData(RequestDataCmd {
                data: "hello\n".into(),
            })))
            .await
            .unwrap();

        let events = read_all(client).await;
        let stdout: String = events
            .iter()
            .filter_map(|e| match e {
                Command::ResponseData(r) if !r.is_error => Some(r.data.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, "[hello]");
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn data_before_init_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle, _state) = start(dir.path(), WAIT);

        client
            .write_all(&line(&Command::RequestData(RequestDataCmd {
                data: "early".into(),
            })))
            .await
            .unwrap();

        assert!(read_all(client).await.is_empty());
        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(ConnectionError::Session(SessionError::NotStarted))
        ));
    }

    #[tokio::test]
    async fn peer_sent_terminate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle, _state) = start(dir.path(), WAIT);

        client
            .write_all(&line(&Command::Terminate(TerminateCmd { code: 0 })))
            .await
            .unwrap();

        assert!(read_all(client).await.is_empty());
        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(ConnectionError::UnexpectedCommand {
                command: "terminateCmd"
            })
        ));
    }

    #[tokio::test]
    async fn overlong_line_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle, _state) = start(dir.path(), WAIT);

        let mut long = vec![b'x'; 4096];
        long.push(b'\n');
        client.write_all(&long).await.unwrap();

        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::LineTooLong { max: 1024 })));
    }

    #[tokio::test]
    async fn deadline_expiry_closes_idle_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (client, handle, _state) = start(dir.path(), Duration::from_millis(200));

        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::DeadlineExpired)));
        drop(client);
    }

    #[tokio::test]
    async fn deadline_stops_running_helper() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle, _state) = start(dir.path(), Duration::from_millis(300));

        client
            .write_all(&line(&shell_mount("exec sleep 30")))
            .await
            .unwrap();

        let events = read_all(client).await;
        assert!(!events.iter().any(|e| matches!(e, Command::Terminate(_))));
        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::DeadlineExpired)));
    }

    #[tokio::test]
    async fn deadline_fires_while_helper_stdin_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let (client, handle, state) =
            start_with_line_limit(dir.path(), Duration::from_millis(500), 64 * 1024);
        let (_read, mut write) = client.into_split();

        // The helper never reads stdin, so the pipe and the inbound channel fill up.
        write
            .write_all(&line(&shell_mount("exec sleep 30")))
            .await
            .unwrap();
        let chunk = line(&Command::RequestData(RequestDataCmd {
            data: "x".repeat(16 * 1024),
        }));
        let flood = tokio::spawn(async move {
            for _ in 0..40 {
                if write.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(
            matches!(result, Err(ConnectionError::DeadlineExpired)),
            "got {result:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(*state.borrow(), ConnectionState::Closed);
        flood.abort();
    }

    #[tokio::test]
    async fn aborted_task_is_a_teardown_cause() {
        let handle = tokio::spawn(std::future::pending::<Result<(), ConnectionError>>());
        handle.abort();
        let result = join_task(handle, "writer").await;
        assert!(matches!(
            result,
            Err(ConnectionError::TaskFailed { task: "writer", .. })
        ));
    }

    #[tokio::test]
    async fn external_cancel_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = UnixStream::pair().unwrap();
        let cancel = CancellationToken::new();
        let handler = ConnectionHandler::new(
            launcher(dir.path()),
            ConnectionLimits {
                deadline: Instant::now() + WAIT,
                max_line_bytes: 1024,
                channel_capacity: 8,
            },
            SessionOptions::default(),
            cancel.clone(),
        );
        let handle = tokio::spawn(handler.run(server));

        cancel.cancel();
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert!(read_all(client).await.is_empty());
    }
}
