use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use bytes::Bytes;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{config::PullConfig, event::PullEvent, registry::SinkRegistry, sink::SinkId};

/// Messages queued to the session task by itself and by sink tasks.
#[derive(Debug)]
pub(crate) enum Notice {
    /// Deferred evaluation pass.
    Evaluate,
    Accepted { sink: SinkId, bytes: u64 },
    WriteFailed { sink: SinkId },
    /// Process exited or socket peer hung up.
    Terminated { sink: SinkId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Running,
    Terminated,
}

/// Bookkeeping of one transfer session, everything but the producer.
pub(crate) struct PullState {
    pub(crate) config: PullConfig,
    pub(crate) state: SessionState,
    pub(crate) registry: SinkRegistry,
    /// Set by a graceful close request.
    pub(crate) closed: bool,
    /// Set by `stop()` and by producer failures.
    pub(crate) aborted: bool,
    pub(crate) total_in: u64,
    pub(crate) start_time: Instant,
    progress_next: Option<u64>,
    /// An `Evaluate` notice is queued.
    pub(crate) pass_posted: bool,
    /// A nested pass consumed the queued notice without doing any work.
    pub(crate) pass_dismissed: bool,
    /// Evaluation passes in progress.
    pub(crate) depth: usize,
    events: broadcast::Sender<PullEvent>,
    pub(crate) notices: mpsc::UnboundedSender<Notice>,
    pub(crate) cancel: CancellationToken,
    /// Writer tasks of released sinks, still draining.
    writers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PullState {
    pub(crate) fn new(
        config: PullConfig,
        events: broadcast::Sender<PullEvent>,
        notices: mpsc::UnboundedSender<Notice>,
        cancel: CancellationToken,
        writers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            registry: SinkRegistry::new(),
            closed: false,
            aborted: false,
            total_in: 0,
            start_time: Instant::now(),
            progress_next: None,
            pass_posted: false,
            pass_dismissed: false,
            depth: 0,
            events,
            notices,
            cancel,
            writers,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.closed = false;
        self.aborted = false;
        self.total_in = 0;
        self.start_time = Instant::now();
        self.progress_next = self.config.progress_interval;
    }

    pub(crate) fn emit(&self, event: PullEvent) {
        // No subscriber is not an error.
        let _ = self.events.send(event);
    }

    /// Fans `data` out to every running sink. True if at least one sink
    /// took it. The aggregate counter moves even when none did.
    pub(crate) fn write(&mut self, data: Bytes) -> bool {
        if data.is_empty() {
            return true;
        }
        self.total_in += data.len() as u64;

        let mut success = false;
        let mut failed = false;
        for ctx in self.registry.running_mut() {
            if ctx.deliver(data.clone()) {
                success = true;
            } else {
                log::error!("error writing on {}", ctx.name());
                ctx.running = false;
                failed = true;
            }
        }

        // Never evaluate from inside write(), only post a pass.
        if failed || self.progress_due() || self.needs_more_input() {
            self.schedule_evaluation();
        }
        success
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.schedule_evaluation();
    }

    pub(crate) fn stop(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        self.abort_all();
        self.schedule_evaluation();
    }

    pub(crate) fn stop_sink(&mut self, sink: SinkId) {
        if self.registry.mark_stopped(sink) {
            self.schedule_evaluation();
        }
    }

    pub(crate) fn abort_all(&mut self) {
        self.registry.mark_all_stopped();
        self.aborted = true;
    }

    pub(crate) fn bytes_accepted(&mut self, sink: SinkId, bytes: u64) {
        let total_in = self.total_in;
        let low_water_mark = self.config.low_water_mark;
        let underflow = match self.registry.get_mut(sink) {
            Some(ctx) => {
                ctx.total_out += bytes;
                total_in.saturating_sub(ctx.total_out) <= low_water_mark
            }
            None => false,
        };
        if underflow {
            self.schedule_evaluation();
        }
    }

    /// True when every running sink is at or below the low-water mark and
    /// there is at least one of them.
    pub(crate) fn needs_more_input(&self) -> bool {
        if self.closed || self.max_reached() {
            return false;
        }
        let mut underflow = false;
        for ctx in self.registry.iter().filter(|ctx| ctx.running) {
            if self.total_in.saturating_sub(ctx.total_out) > self.config.low_water_mark {
                // This sink is still catching up.
                return false;
            }
            underflow = true;
        }
        underflow
    }

    pub(crate) fn max_reached(&self) -> bool {
        matches!(self.config.max_in, Some(max) if self.total_in >= max)
    }

    pub(crate) fn remaining(&self) -> Option<u64> {
        self.config
            .max_in
            .map(|max| max.saturating_sub(self.total_in))
    }

    pub(crate) fn progress_due(&self) -> bool {
        matches!(self.progress_next, Some(next) if self.total_in >= next)
    }

    pub(crate) fn report_progress(&mut self) {
        self.emit(PullEvent::Progress {
            total_in: self.total_in,
            max_hint: self.config.max_hint(),
        });
        self.progress_next = self
            .config
            .progress_interval
            .map(|interval| self.total_in + interval);
    }

    /// Posts one `Evaluate` notice; further requests coalesce until it runs.
    pub(crate) fn schedule_evaluation(&mut self) {
        if !self.pass_posted {
            self.pass_posted = self.notices.send(Notice::Evaluate).is_ok();
        }
    }

    /// Removes every sink that must terminate, runs its teardown and reports
    /// it. A sink succeeds only if the session was closed while it was still
    /// running.
    pub(crate) fn release_terminated(&mut self) {
        let closed = self.closed;
        for ctx in self.registry.take_terminating(closed) {
            let graceful = closed && ctx.running;
            log::debug!(
                "transfer to {} sink {} {}, {} bytes accepted",
                ctx.kind(),
                ctx.name(),
                if graceful { "completed" } else { "aborted" },
                ctx.total_out
            );
            let event = PullEvent::SinkCompleted {
                sink: ctx.id(),
                name: ctx.shared_name(),
                success: graceful,
            };
            let writer = ctx.teardown(graceful);
            if let Ok(mut writers) = self.writers.lock() {
                writers.push(writer);
            }
            self.emit(event);
        }
    }

    /// Aborts and reports every remaining sink.
    pub(crate) fn release_all(&mut self) {
        self.abort_all();
        self.release_terminated();
    }
}
