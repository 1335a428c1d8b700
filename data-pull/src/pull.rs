use std::{
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{Stream, StreamExt};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    config::PullConfig,
    event::{PullEvent, PullReport},
    producer::{Producer, Transfer},
    registry::SinkRegistry,
    sink::{SinkHandle, SinkId},
    state::{Notice, PullState, SessionState},
};

pub type PullEventStream = Pin<Box<dyn Stream<Item = PullEvent> + Send>>;

/// Handle to a transfer session.
///
/// The session runs in its own task, which owns every piece of mutable
/// state; the handle only sends it commands. A session is single-use: once
/// `start` failed or the transfer completed, it cannot be started again.
/// Dropping the handle aborts a running transfer.
pub struct DataPull {
    cancel: CancellationToken,
    tx: mpsc::Sender<PullCommand>,
    events: broadcast::Sender<PullEvent>,
    report: watch::Receiver<Option<PullReport>>,
    started: Arc<AtomicBool>,
    writers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Cancelled by `stop` on a started session. Wakes a producer blocked
    /// on its input.
    stopped: CancellationToken,
}

impl DataPull {
    pub fn new<P: Producer>(config: PullConfig, producer: P) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(1024);
        let (report_tx, report) = watch::channel(None);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let started = Arc::new(AtomicBool::new(false));
        let writers = Arc::new(Mutex::new(Vec::new()));
        let stopped = cancel.child_token();

        let session = Session {
            producer,
            state: PullState::new(
                config,
                events.clone(),
                notice_tx,
                cancel.clone(),
                Arc::clone(&writers),
            ),
            report: report_tx,
            started: Arc::clone(&started),
            stopped: stopped.clone(),
        };
        tokio::spawn(session.run(rx, notice_rx));

        Self {
            cancel,
            tx,
            events,
            report,
            started,
            writers,
            stopped,
        }
    }

    /// Registers the sinks and initializes the producer. Fails when no valid
    /// sink remains after dropping duplicates and claimed handles, when the
    /// producer fails to initialize, or when the session was already used.
    pub async fn start(&self, sinks: Vec<SinkHandle>) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(PullCommand::Start { sinks, result: tx }).await?;
        rx.await?
    }

    /// Aborts every sink. Takes effect on the next evaluation pass, or at
    /// once if the producer is waiting for input.
    pub async fn stop(&self) -> anyhow::Result<()> {
        // Before start, stop is a no-op and must not leak into the transfer.
        if self.is_started() {
            self.stopped.cancel();
        }
        self.send(PullCommand::Stop).await
    }

    /// Aborts one sink. No-op if it is not registered.
    pub async fn stop_sink(&self, sink: SinkId) -> anyhow::Result<()> {
        self.send(PullCommand::StopSink(sink)).await
    }

    /// Ends the input from outside the producer.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.send(PullCommand::Close).await
    }

    /// Starts the transfer and waits for its completion.
    pub async fn run(&self, sinks: Vec<SinkHandle>) -> anyhow::Result<PullReport> {
        self.start(sinks).await?;
        self.wait().await
    }

    /// Waits for the final report of a started session, then for every
    /// sink to finish writing what it was given.
    pub async fn wait(&self) -> anyhow::Result<PullReport> {
        if !self.is_started() {
            return Err(anyhow::anyhow!("data transfer not started"));
        }
        let mut report = self.report.clone();
        let report = report
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow::anyhow!("data pull session ended without a report"))?
            .clone()
            .ok_or_else(|| anyhow::anyhow!("data pull session ended without a report"))?;

        let writers = match self.writers.lock() {
            Ok(mut writers) => std::mem::take(&mut *writers),
            Err(_) => Vec::new(),
        };
        for writer in writers {
            let _ = writer.await;
        }
        Ok(report)
    }

    /// Receives the events emitted from now on. Subscribe before `start`
    /// to see them all.
    pub fn subscribe(&self) -> broadcast::Receiver<PullEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> PullEventStream {
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|r| async move {
            match r {
                Ok(event) => Some(event),
                Err(e) => {
                    log::warn!("data pull event stream: {}", e);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    async fn send(&self, cmd: PullCommand) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("data pull session is gone"))
    }
}

impl Drop for DataPull {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum PullCommand {
    Start {
        sinks: Vec<SinkHandle>,
        result: oneshot::Sender<anyhow::Result<()>>,
    },
    Stop,
    StopSink(SinkId),
    Close,
}

struct Session<P> {
    producer: P,
    state: PullState,
    report: watch::Sender<Option<PullReport>>,
    started: Arc<AtomicBool>,
    stopped: CancellationToken,
}

impl<P: Producer> Session<P> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<PullCommand>,
        mut notices: mpsc::UnboundedReceiver<Notice>,
    ) {
        let cancel = self.state.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = commands.recv() => {
                    self.handle_command(cmd).await;
                },
                Some(notice) = notices.recv() => {
                    self.handle_notice(notice).await;
                },
            }
        }
        self.abandon();
    }

    async fn handle_command(&mut self, cmd: PullCommand) {
        match cmd {
            PullCommand::Start { sinks, result } => {
                let started = self.start(sinks).await;
                let _ = result.send(started);
            }
            PullCommand::Stop => self.state.stop(),
            PullCommand::StopSink(sink) => self.state.stop_sink(sink),
            PullCommand::Close => {
                if self.state.state == SessionState::Running {
                    self.state.close();
                }
            }
        }
    }

    async fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Evaluate => self.evaluate().await,
            Notice::Accepted { sink, bytes } => self.state.bytes_accepted(sink, bytes),
            Notice::WriteFailed { sink } => self.state.stop_sink(sink),
            Notice::Terminated { sink } => {
                log::debug!("{} terminated before completion", sink);
                self.state.stop_sink(sink);
            }
        }
    }

    async fn start(&mut self, sinks: Vec<SinkHandle>) -> anyhow::Result<()> {
        match self.state.state {
            SessionState::Idle => {}
            SessionState::Running => return Err(anyhow::anyhow!("data transfer already started")),
            SessionState::Terminated => {
                return Err(anyhow::anyhow!("data transfer session already terminated"));
            }
        }

        self.state.reset();
        // Nothing is claimed until the producer is ready: a failed start
        // leaves every handle usable by another session.
        let sinks = SinkRegistry::candidates(sinks);
        if sinks.is_empty() {
            self.state.state = SessionState::Terminated;
            return Err(anyhow::anyhow!("no valid sink to transfer to"));
        }

        if let Err(e) = self.producer.initialize().await {
            log::debug!("data transfer failed to start: {:#}", e);
            self.state.state = SessionState::Terminated;
            return Err(e.context("data producer failed to initialize"));
        }

        let state = &mut self.state;
        state.registry.admit(sinks, &state.notices);
        if state.registry.is_empty() {
            // Claimed by another session in the meantime.
            state.state = SessionState::Terminated;
            self.producer.finalize(false);
            return Err(anyhow::anyhow!("no valid sink to transfer to"));
        }

        log::debug!(
            "data transfer started on {} sink(s)",
            self.state.registry.len()
        );
        self.state.state = SessionState::Running;
        self.started.store(true, Ordering::Relaxed);
        self.state.emit(PullEvent::Started);
        self.state.schedule_evaluation();
        Ok(())
    }

    /// Runs one evaluation pass unless another one is in progress.
    async fn evaluate(&mut self) {
        if self.state.depth > 0 {
            self.state.pass_dismissed = true;
            return;
        }
        self.state.depth += 1;
        self.pass().await;
        self.state.depth -= 1;
    }

    /// One step of the state machine: pull more data if every sink is low,
    /// release terminated sinks, complete the session once none is left.
    async fn pass(&mut self) {
        self.state.pass_posted = false;

        // Stale pass.
        if self.state.registry.is_empty() {
            return;
        }

        if self.state.progress_due() {
            self.state.report_progress();
        }

        if self.state.needs_more_input() {
            // A producer waiting on its input must not outlive the handle.
            let cancel = self.state.cancel.clone();
            let stopped = self.stopped.clone();
            let mut transfer = Transfer::new(&mut self.state);
            let produced = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = stopped.cancelled() => None,
                produced = self.producer.produce_more(&mut transfer) => Some(produced),
            };
            match produced {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    log::error!("data producer failed, aborting transfer: {:#}", e);
                    self.state.abort_all();
                }
                None => {
                    log::debug!("data producer interrupted");
                    self.state.abort_all();
                }
            }
        }

        if self.state.max_reached() {
            self.state.closed = true;
        }

        self.state.release_terminated();

        if self.state.registry.is_empty() {
            self.complete();
        } else if std::mem::take(&mut self.state.pass_dismissed) {
            // Nothing on the session task nests passes today; a dismissed
            // one is reposted rather than lost.
            self.state.pass_posted = false;
            self.state.schedule_evaluation();
        } else if self.state.needs_more_input() {
            self.state.schedule_evaluation();
        }
    }

    fn complete(&mut self) {
        let success = self.state.closed && !self.state.aborted;
        let report = PullReport {
            success,
            total_in: self.state.total_in,
            elapsed: self.state.start_time.elapsed(),
        };
        log::debug!(
            "data transfer {}, read {} bytes, time: {} ms, bandwidth: {} b/s, {} B/s",
            if success { "completed" } else { "aborted" },
            report.total_in,
            report.elapsed.as_millis(),
            report.bits_per_second(),
            report.bytes_per_second()
        );

        self.producer.finalize(success);
        self.state.state = SessionState::Terminated;
        self.state.emit(PullEvent::Completed(report.clone()));
        self.report.send_replace(Some(report));
    }

    /// The handle was dropped: report every remaining sink as failed.
    fn abandon(&mut self) {
        if self.state.state != SessionState::Running || self.state.registry.is_empty() {
            return;
        }
        log::debug!("data transfer dropped while running");
        self.state.release_all();
        self.complete();
    }
}

#[cfg(test)]
#[path = "pull_test.rs"]
mod pull_test;
