use std::{
    fmt,
    pin::Pin,
    process::ExitStatus,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    process::Child,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::state::Notice;

pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a sink. Clones of a [`SinkHandle`] share it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    fn next() -> Self {
        Self(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

/// Capability class of a sink, fixed when the handle is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    /// Any writer: file, pipe, stdout, in-memory stream.
    Plain,
    /// Standard input of a child process.
    Process,
    /// Connected TCP socket.
    Socket,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Plain => write!(f, "plain"),
            SinkKind::Process => write!(f, "process"),
            SinkKind::Socket => write!(f, "socket"),
        }
    }
}

pub(crate) struct SinkParts {
    writer: BoxWriter,
    /// Resolves when the sink ends on its own (process exit, peer hang-up).
    terminated: Option<BoxFuture<'static, ()>>,
}

/// Destination of a transfer.
///
/// The handle stays with the caller; a session claims the underlying writer
/// when it starts. A claimed handle is no longer valid and is ignored by any
/// later session.
#[derive(Clone)]
pub struct SinkHandle {
    id: SinkId,
    name: Arc<str>,
    kind: SinkKind,
    parts: Arc<Mutex<Option<SinkParts>>>,
}

impl SinkHandle {
    pub fn plain<W>(name: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self::build(name.into(), SinkKind::Plain, Box::pin(writer), None)
    }

    /// Wraps a child spawned with a piped stdin. The child is reaped in the
    /// background; its exit status is available from the returned [`ProcessExit`].
    pub fn process(name: impl Into<String>, mut child: Child) -> anyhow::Result<(Self, ProcessExit)> {
        let name = name.into();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("process {} has no piped stdin", name))?;

        let (status_tx, status_rx) = watch::channel(None);
        let process_name = name.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => {
                    log::debug!("process {} exited: {}", process_name, status);
                    Some(status)
                }
                Err(e) => {
                    log::error!("wait for process {} error: {:#?}", process_name, e);
                    None
                }
            };
            status_tx.send_replace(Some(status));
        });

        let mut exited = status_rx.clone();
        let terminated = async move {
            let _ = exited.wait_for(Option::is_some).await;
        }
        .boxed();

        let handle = Self::build(name, SinkKind::Process, Box::pin(stdin), Some(terminated));
        Ok((handle, ProcessExit(status_rx)))
    }

    /// Wraps a connected socket. Anything the peer sends is discarded; the
    /// peer closing its side counts as an unexpected disconnection.
    pub fn socket(name: impl Into<String>, stream: TcpStream) -> Self {
        let (mut read_half, write_half) = stream.into_split();
        let terminated = async move {
            let mut buf = [0u8; 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
        .boxed();
        Self::build(name.into(), SinkKind::Socket, Box::pin(write_half), Some(terminated))
    }

    fn build(
        name: String,
        kind: SinkKind,
        writer: BoxWriter,
        terminated: Option<BoxFuture<'static, ()>>,
    ) -> Self {
        Self {
            id: SinkId::next(),
            name: name.into(),
            kind,
            parts: Arc::new(Mutex::new(Some(SinkParts { writer, terminated }))),
        }
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    /// False once a session has claimed the sink.
    pub fn is_valid(&self) -> bool {
        self.parts.lock().map(|parts| parts.is_some()).unwrap_or(false)
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub(crate) fn claim(&self) -> Option<SinkParts> {
        self.parts.lock().ok().and_then(|mut parts| parts.take())
    }
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Exit status of a process sink.
#[derive(Clone)]
pub struct ProcessExit(watch::Receiver<Option<Option<ExitStatus>>>);

impl ProcessExit {
    pub async fn wait(&mut self) -> anyhow::Result<ExitStatus> {
        let state = self
            .0
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow::anyhow!("process watcher dropped"))?;
        (*state).flatten().ok_or_else(|| anyhow::anyhow!("failed to wait for process"))
    }

    /// None while the process is still running.
    pub fn try_status(&self) -> Option<ExitStatus> {
        (*self.0.borrow()).flatten()
    }
}

enum SinkCmd {
    Data(Bytes),
    Close,
}

/// Session side of a registered sink: the writer queue plus the tokens
/// that end its background tasks.
pub(crate) struct SinkLink {
    queue: mpsc::UnboundedSender<SinkCmd>,
    abort: CancellationToken,
    watch: CancellationToken,
    writer: JoinHandle<()>,
}

impl SinkLink {
    /// Spawns the writer task, and the watcher task for sinks that can end
    /// on their own. Both report to the session through `notices`.
    pub(crate) fn attach(
        handle: &SinkHandle,
        parts: SinkParts,
        notices: &mpsc::UnboundedSender<Notice>,
    ) -> Self {
        // Not tied to the session token: a closed sink keeps draining after
        // the session is gone.
        let abort = CancellationToken::new();
        let watch = abort.child_token();
        let (queue, rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(
            handle.id(),
            handle.shared_name(),
            handle.kind(),
            parts.writer,
            rx,
            notices.clone(),
            abort.clone(),
        ));

        if let Some(terminated) = parts.terminated {
            let id = handle.id();
            let name = handle.shared_name();
            let kind = handle.kind();
            let notices = notices.clone();
            let watch = watch.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = watch.cancelled() => {},
                    _ = terminated => {
                        log::debug!("{} sink {} terminated", kind, name);
                        let _ = notices.send(Notice::Terminated { sink: id });
                    },
                }
            });
        }

        Self {
            queue,
            abort,
            watch,
            writer,
        }
    }

    /// Queues a chunk for the writer. False when the writer is gone.
    pub(crate) fn deliver(&self, data: Bytes) -> bool {
        self.queue.send(SinkCmd::Data(data)).is_ok()
    }

    /// Graceful teardown lets the writer drain its queue and shut the sink
    /// down; otherwise both tasks are cancelled at once. Returns the writer
    /// task, which ends once the sink is shut down.
    pub(crate) fn teardown(self, graceful: bool) -> JoinHandle<()> {
        if graceful {
            let _ = self.queue.send(SinkCmd::Close);
            self.watch.cancel();
        } else {
            self.abort.cancel();
        }
        self.writer
    }
}

async fn run_writer(
    id: SinkId,
    name: Arc<str>,
    kind: SinkKind,
    mut writer: BoxWriter,
    mut rx: mpsc::UnboundedReceiver<SinkCmd>,
    notices: mpsc::UnboundedSender<Notice>,
    abort: CancellationToken,
) {
    loop {
        let cmd = tokio::select! {
            _ = abort.cancelled() => break,
            cmd = rx.recv() => cmd,
        };
        match cmd {
            Some(SinkCmd::Data(data)) => {
                let result = tokio::select! {
                    _ = abort.cancelled() => break,
                    result = write_chunk(&mut writer, &data) => result,
                };
                match result {
                    Ok(()) => {
                        let bytes = data.len() as u64;
                        let _ = notices.send(Notice::Accepted { sink: id, bytes });
                    }
                    Err(e) => {
                        log::error!("error writing on {}: {}", name, e);
                        let _ = notices.send(Notice::WriteFailed { sink: id });
                        return;
                    }
                }
            }
            Some(SinkCmd::Close) => {
                match kind {
                    SinkKind::Process => log::debug!("closing write channel of {}", name),
                    SinkKind::Socket => log::debug!("disconnecting from {}", name),
                    SinkKind::Plain => log::debug!("closing {}", name),
                }
                if let Err(e) = writer.shutdown().await {
                    log::warn!("shutdown {} error: {}", name, e);
                }
                return;
            }
            None => return,
        }
    }
    log::debug!("transfer to {} aborted", name);
}

async fn write_chunk(writer: &mut BoxWriter, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

#[cfg(test)]
#[path = "sink_test.rs"]
mod sink_test;
