use std::{sync::Arc, time::Duration};

use crate::sink::SinkId;

/// Notifications published by a [`DataPull`](crate::pull::DataPull) session.
///
/// `Started` and `Completed` are emitted at most once, `SinkCompleted`
/// exactly once per registered sink, always before `Completed`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PullEvent {
    Started,
    Progress {
        total_in: u64,
        max_hint: Option<u64>,
    },
    SinkCompleted {
        sink: SinkId,
        name: Arc<str>,
        success: bool,
    },
    Completed(PullReport),
}

/// Final outcome of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullReport {
    /// True when the session was closed and never aborted.
    pub success: bool,
    /// Bytes written by the producer.
    pub total_in: u64,
    pub elapsed: Duration,
}

impl PullReport {
    pub fn bits_per_second(&self) -> u64 {
        let ms = self.elapsed.as_millis();
        if ms == 0 {
            return 0;
        }
        u64::try_from(u128::from(self.total_in) * 8 * 1000 / ms).unwrap_or(u64::MAX)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bits_per_second() / 8
    }
}
