use std::future::Future;

use bytes::Bytes;

use crate::state::PullState;

/// Source of the bytes a [`DataPull`](crate::pull::DataPull) session
/// replicates into its sinks.
///
/// The session decides when data is needed; the producer only supplies it.
pub trait Producer: Send + 'static {
    /// Called once by `start`, after the sinks are registered. An error
    /// cancels the start.
    fn initialize(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// Called when every running sink is below the low-water mark. An
    /// implementation writes zero or more chunks through `transfer` and
    /// calls [`Transfer::close`] once the input is exhausted. An error
    /// aborts every sink.
    fn produce_more(
        &mut self,
        transfer: &mut Transfer<'_>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Called exactly once at the end of a started session.
    fn finalize(&mut self, success: bool) {
        let _ = success;
    }
}

/// Write access to a running session, lent to [`Producer::produce_more`].
pub struct Transfer<'a> {
    state: &'a mut PullState,
}

impl<'a> Transfer<'a> {
    pub(crate) fn new(state: &'a mut PullState) -> Self {
        Self { state }
    }

    /// Copies `data` to every running sink. Returns false when no sink took it.
    pub fn write(&mut self, data: &[u8]) -> bool {
        self.write_bytes(Bytes::copy_from_slice(data))
    }

    pub fn write_bytes(&mut self, data: Bytes) -> bool {
        self.state.write(data)
    }

    /// Ends the input. Sinks drain what they were given, then shut down.
    pub fn close(&mut self) {
        self.state.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    pub fn total_in(&self) -> u64 {
        self.state.total_in
    }

    /// Bytes left before the configured maximum, None when unbounded.
    pub fn remaining(&self) -> Option<u64> {
        self.state.remaining()
    }
}
