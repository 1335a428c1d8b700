/// Default low-water mark in bytes (128 KiB).
pub const DEFAULT_LOW_WATER_MARK: u64 = 128 * 1024;

/// Settings of one transfer session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullConfig {
    /// More input is pulled only when every running sink has at most this
    /// many bytes submitted but not yet accepted.
    pub low_water_mark: u64,
    /// Stop pulling and close gracefully once this many bytes were written.
    pub max_in: Option<u64>,
    /// Emit a progress event every time this many more bytes were written.
    pub progress_interval: Option<u64>,
    /// Expected total size, reported along with progress events.
    pub progress_max_hint: Option<u64>,
}

impl PullConfig {
    pub fn new(low_water_mark: u64) -> Self {
        Self {
            low_water_mark,
            max_in: None,
            progress_interval: None,
            progress_max_hint: None,
        }
    }

    pub fn with_max_in(mut self, max_in: u64) -> Self {
        self.max_in = Some(max_in);
        self
    }

    /// A zero interval disables progress reporting.
    pub fn with_progress_interval(mut self, bytes: u64) -> Self {
        self.progress_interval = (bytes > 0).then_some(bytes);
        self
    }

    pub fn with_progress_max_hint(mut self, bytes: u64) -> Self {
        self.progress_max_hint = (bytes > 0).then_some(bytes);
        self
    }

    /// Size reported as the expected total in progress events.
    pub fn max_hint(&self) -> Option<u64> {
        self.progress_max_hint.or(self.max_in)
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LOW_WATER_MARK)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
