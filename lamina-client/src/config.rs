//! Session configuration.

use std::time::Duration;

/// When buffered operations are sent to the tablet servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Every operation is sent on its own as soon as it is applied; `apply`
    /// returns a completion that resolves when the server has responded.
    #[default]
    AutoFlushSync,
    /// Operations accumulate in the session's buffers and are flushed in the
    /// background, either when a buffer fills or when the flush interval
    /// elapses.
    AutoFlushBackground,
    /// Operations accumulate until the application calls
    /// [`Session::flush`](crate::session::Session::flush).
    ManualFlush,
}

/// The consistency contract between this session's writes and subsequent
/// reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExternalConsistencyMode {
    /// The client forwards the last write timestamp it observed with every
    /// request, so its own reads see its own writes.
    #[default]
    ClientPropagated,
    /// The server delays the write until replica clocks are past the write
    /// timestamp.
    CommitWait,
}

/// Snapshot of the session's tunables. Mutated only through the session's
/// setters, which refuse to run while operations are pending.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub(crate) flush_mode: FlushMode,
    pub(crate) external_consistency_mode: ExternalConsistencyMode,
    pub(crate) mutation_buffer_space: usize,
    pub(crate) low_watermark_percentage: f64,
    pub(crate) flush_interval: Duration,
    pub(crate) timeout: Option<Duration>,
    pub(crate) ignore_duplicate_rows: bool,
}

impl SessionConfig {
    /// The buffer size at which probabilistic early-flush admission arms,
    /// derived from the watermark percentage.
    pub(crate) fn low_watermark(&self) -> usize {
        (self.mutation_buffer_space as f64 * self.low_watermark_percentage) as usize
    }
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            flush_mode: FlushMode::default(),
            external_consistency_mode: ExternalConsistencyMode::default(),
            mutation_buffer_space: 1000,
            low_watermark_percentage: 0.5,
            flush_interval: Duration::from_millis(1000),
            timeout: None,
            ignore_duplicate_rows: false,
        }
    }
}
