//! The channel between a dispatcher and its worker.
//!
//! A channel carries serialized requests out and [`ChannelEvent`]s back. How the
//! worker is actually hosted is up to the [`WorkerLauncher`]:
//!
//! - [`ThreadLauncher`] runs a [`WorkerHost`] on its own OS thread with its own
//!   single-threaded runtime.
//! - [`ProcessLauncher`] spawns a worker executable and speaks NDJSON over its
//!   stdin/stdout.
//! - [`NoWorkers`] stands for a host that cannot run workers at all.

use std::io;
use std::num::NonZeroUsize;
use std::process::Stdio;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::error::LaunchError;
use super::host::{WorkerHost, DEFAULT_HANDLE_CAPACITY};
use crate::engine::EngineFactory;

/// Something the worker side reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One serialized response.
    Message(String),
    /// The channel is broken. No further messages will arrive.
    Error(String),
}

/// Owner-side control over a running worker.
pub trait WorkerHandle: Send {
    /// Stop the worker. Must not block.
    fn terminate(&mut self);
}

/// A live connection to one worker.
pub struct WorkerChannel {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    handle: Box<dyn WorkerHandle>,
}

impl WorkerChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        handle: impl WorkerHandle + 'static,
    ) -> Self {
        Self {
            outbound,
            events,
            handle: Box::new(handle),
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<ChannelEvent>,
        Box<dyn WorkerHandle>,
    ) {
        (self.outbound, self.events, self.handle)
    }
}

/// Starts workers.
///
/// `launch` is called from inside the dispatcher's runtime, so implementations
/// may spawn tasks.
pub trait WorkerLauncher: Send + Sync {
    /// Whether this host can run workers at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Start a worker at `location`.
    fn launch(&self, location: &str) -> Result<WorkerChannel, LaunchError>;
}

/// A host without worker support. Every dispatcher using it runs in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWorkers;

impl WorkerLauncher for NoWorkers {
    fn is_supported(&self) -> bool {
        false
    }

    fn launch(&self, _location: &str) -> Result<WorkerChannel, LaunchError> {
        Err(LaunchError::Unsupported)
    }
}

// ============================================================================
// Thread workers
// ============================================================================

/// Runs each worker on a dedicated thread.
pub struct ThreadLauncher {
    factory: Arc<dyn EngineFactory>,
    handle_capacity: NonZeroUsize,
}

impl ThreadLauncher {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            handle_capacity: DEFAULT_HANDLE_CAPACITY,
        }
    }

    pub fn with_handle_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.handle_capacity = capacity;
        self
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, location: &str) -> Result<WorkerChannel, LaunchError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let host = Arc::new(WorkerHost::new(
            Arc::clone(&self.factory),
            self.handle_capacity,
        ));

        let thread = std::thread::Builder::new()
            .name("pagefind-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = event_tx.send(ChannelEvent::Error(format!(
                            "failed to start worker runtime: {err}"
                        )));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let post = event_tx.clone();
                    tokio::select! {
                        () = host.serve(request_rx, move |line| {
                            let _ = post.send(ChannelEvent::Message(line));
                        }) => {}
                        _ = shutdown_rx => {}
                    }
                });
                // The event sender drops here, which the dispatcher sees as
                // the end of the channel.
            })
            .map_err(LaunchError::ThreadFailed)?;

        debug!(location, "worker thread started");

        Ok(WorkerChannel::new(
            request_tx,
            event_rx,
            ThreadHandle {
                shutdown: Some(shutdown_tx),
                _thread: thread,
            },
        ))
    }
}

struct ThreadHandle {
    shutdown: Option<oneshot::Sender<()>>,
    _thread: JoinHandle<()>,
}

impl WorkerHandle for ThreadHandle {
    fn terminate(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

// ============================================================================
// Process workers
// ============================================================================

/// Spawns the worker executable found at the launch location.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra command-line arguments for the worker.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, location: &str) -> Result<WorkerChannel, LaunchError> {
        let mut child = Command::new(location)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(LaunchError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| not_captured("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| not_captured("stdout"))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_requests(stdin, request_rx, event_tx.clone()));
        let reader = tokio::spawn(read_responses(stdout, event_tx));

        debug!(location, pid = child.id(), "worker process spawned");

        Ok(WorkerChannel::new(
            request_tx,
            event_rx,
            ProcessHandle {
                child,
                tasks: [writer, reader],
            },
        ))
    }
}

fn not_captured(stream: &str) -> LaunchError {
    LaunchError::SpawnFailed(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("{stream} not captured"),
    ))
}

async fn write_line(writer: &mut BufWriter<ChildStdin>, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn write_requests(
    stdin: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut writer = BufWriter::new(stdin);
    while let Some(line) = requests.recv().await {
        if let Err(err) = write_line(&mut writer, &line).await {
            let _ = events.send(ChannelEvent::Error(format!(
                "failed to write to worker: {err}"
            )));
            break;
        }
    }
}

async fn read_responses(stdout: ChildStdout, events: mpsc::UnboundedSender<ChannelEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if events.send(ChannelEvent::Message(line)).is_err() {
                    // Nobody is listening anymore
                    break;
                }
            }
            Ok(None) => {
                let _ = events.send(ChannelEvent::Error("worker process exited".to_string()));
                break;
            }
            Err(err) => {
                warn!(error = %err, "worker read error");
                let _ = events.send(ChannelEvent::Error(format!(
                    "failed to read from worker: {err}"
                )));
                break;
            }
        }
    }
}

struct ProcessHandle {
    child: Child,
    tasks: [tokio::task::JoinHandle<()>; 2],
}

impl WorkerHandle for ProcessHandle {
    fn terminate(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Err(err) = self.child.start_kill() {
            debug!(error = %err, "worker process already gone");
        }
    }
}
