use std::{collections::HashSet, sync::Arc};

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    sink::{SinkHandle, SinkId, SinkKind, SinkLink},
    state::Notice,
};

/// Per-sink state kept by the session.
pub(crate) struct SinkContext {
    id: SinkId,
    name: Arc<str>,
    kind: SinkKind,
    /// False means the sink is torn down on the next evaluation pass.
    pub(crate) running: bool,
    /// Bytes the sink confirmed as written.
    pub(crate) total_out: u64,
    link: SinkLink,
}

impl SinkContext {
    pub(crate) fn id(&self) -> SinkId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub(crate) fn kind(&self) -> SinkKind {
        self.kind
    }

    pub(crate) fn deliver(&self, data: Bytes) -> bool {
        self.link.deliver(data)
    }

    pub(crate) fn teardown(self, graceful: bool) -> JoinHandle<()> {
        self.link.teardown(graceful)
    }
}

/// Registered sinks in registration order.
pub(crate) struct SinkRegistry {
    contexts: Vec<SinkContext>,
}

impl SinkRegistry {
    pub(crate) fn new() -> Self {
        Self {
            contexts: Vec::new(),
        }
    }

    /// Keeps the first handle of every sink no session has claimed yet.
    pub(crate) fn candidates(handles: Vec<SinkHandle>) -> Vec<SinkHandle> {
        let mut seen = HashSet::new();
        handles
            .into_iter()
            .filter(|handle| {
                if !seen.insert(handle.id()) {
                    log::debug!("dropping duplicate sink {}", handle.name());
                    return false;
                }
                if !handle.is_valid() {
                    log::debug!("dropping invalid sink {}", handle.name());
                    return false;
                }
                true
            })
            .collect()
    }

    /// Claims and registers the given sinks. A handle claimed elsewhere
    /// since [`candidates`](Self::candidates) is skipped. Returns the number
    /// of sinks registered.
    pub(crate) fn admit(
        &mut self,
        handles: Vec<SinkHandle>,
        notices: &mpsc::UnboundedSender<Notice>,
    ) -> usize {
        let before = self.contexts.len();
        for handle in handles {
            let Some(parts) = handle.claim() else {
                log::debug!("dropping invalid sink {}", handle.name());
                continue;
            };
            let link = SinkLink::attach(&handle, parts, notices);
            log::debug!("registered {} sink {} as {}", handle.kind(), handle.name(), handle.id());
            self.contexts.push(SinkContext {
                id: handle.id(),
                name: handle.shared_name(),
                kind: handle.kind(),
                running: true,
                total_out: 0,
                link,
            });
        }
        self.contexts.len() - before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SinkContext> {
        self.contexts.iter()
    }

    pub(crate) fn running_mut(&mut self) -> impl Iterator<Item = &mut SinkContext> {
        self.contexts.iter_mut().filter(|ctx| ctx.running)
    }

    pub(crate) fn get_mut(&mut self, id: SinkId) -> Option<&mut SinkContext> {
        self.contexts.iter_mut().find(|ctx| ctx.id == id)
    }

    /// False if the sink is not registered.
    pub(crate) fn mark_stopped(&mut self, id: SinkId) -> bool {
        match self.get_mut(id) {
            Some(ctx) => {
                ctx.running = false;
                true
            }
            None => false,
        }
    }

    pub(crate) fn mark_all_stopped(&mut self) {
        for ctx in &mut self.contexts {
            ctx.running = false;
        }
    }

    /// Removes the contexts that must terminate: all of them once the
    /// session is closed, otherwise only the stopped ones.
    pub(crate) fn take_terminating(&mut self, closed: bool) -> Vec<SinkContext> {
        let (done, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.contexts)
            .into_iter()
            .partition(|ctx| closed || !ctx.running);
        self.contexts = keep;
        done
    }
}
