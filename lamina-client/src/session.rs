//! The write session: configuration, `apply`, `flush`, `close`, error
//! collection, double-buffered admission control, and flush scheduling.
//!
//! A session is a single-producer façade: concurrent `apply` calls are not
//! part of the contract. Internally, however, three parties touch its state
//! (the caller, scheduled flush timers, and I/O completions), so everything
//! they share sits behind one monitor lock. The monitor is never held across
//! an await; flushes and timers run on spawned tasks.
//!
//! Ordering: operations applied to one tablet within one buffer generation
//! are sent in a single batch and executed in order. Two generations may be
//! in flight at once, so ordering across flushes is not guaranteed; callers
//! that need it must await each flush (or each operation, in
//! AUTO_FLUSH_SYNC) before applying the next operation.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use itertools::Itertools;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use lamina_errors::{Error, Result};

use crate::batch::Batch;
use crate::buffer::{Buffer, BufferState, BufferedOperation, FlushNotification, FlushNotifier};
use crate::config::{ExternalConsistencyMode, FlushMode, SessionConfig};
use crate::error_collector::ErrorCollector;
use crate::operation::{Operation, OperationResponse, PendingOperation, RowError};
use crate::router::TabletRouter;
use crate::transport::WriteTransport;

/// Why `apply` rejected an operation. The operation is always handed back,
/// unfrozen and unbuffered, so the caller can retry or drop it.
#[derive(Debug)]
pub enum ApplyError {
    /// Backpressure: no buffer can accept the operation right now. Await the
    /// carried notification before retrying; it resolves when a buffer
    /// generation completes and capacity is likely available again.
    Throttled {
        operation: Box<Operation>,
        notification: FlushNotification,
    },
    /// A programmer error: closed session, manual-flush buffer overflow,
    /// incomplete primary key, and similar. Not retriable as-is.
    Rejected {
        operation: Box<Operation>,
        status: Error,
    },
}

impl ApplyError {
    pub fn status(&self) -> Error {
        match self {
            ApplyError::Throttled { .. } => {
                Error::ServiceUnavailable("all buffers are currently flushing".into())
            }
            ApplyError::Rejected { status, .. } => status.clone(),
        }
    }

    /// The rejected operation, for resubmission.
    pub fn into_operation(self) -> Operation {
        match self {
            ApplyError::Throttled { operation, .. } => *operation,
            ApplyError::Rejected { operation, .. } => *operation,
        }
    }

    /// The flush notification carried by a throttling rejection.
    pub fn notification(&self) -> Option<FlushNotification> {
        match self {
            ApplyError::Throttled { notification, .. } => Some(notification.clone()),
            ApplyError::Rejected { .. } => None,
        }
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status())
    }
}

impl std::error::Error for ApplyError {}

/// A write session over a tablet-location service and an RPC transport.
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    transport: Arc<dyn WriteTransport>,
    router: Arc<dyn TabletRouter>,
    config: Mutex<SessionConfig>,
    error_collector: ErrorCollector,
    monitor: Mutex<Monitor>,
}

/// Everything shared between the caller, flush timers and I/O completions.
struct Monitor {
    buffers: [Buffer; 2],
    active: Option<usize>,
    inactive: VecDeque<usize>,
    closed: bool,
    next_flush_task_id: u64,
}

/// A buffer generation detached for flushing: the operations, the notifier
/// that ends the generation, and the index of the buffer slot to requeue.
struct FlushableBuffer {
    index: usize,
    ops: Vec<BufferedOperation>,
    notifier: FlushNotifier,
}

impl Monitor {
    fn new() -> Monitor {
        Monitor {
            buffers: [Buffer::new(), Buffer::new()],
            active: None,
            inactive: VecDeque::from([0, 1]),
            closed: false,
            next_flush_task_id: 0,
        }
    }

    /// Promotes an inactive buffer to active, beginning a new generation.
    fn promote_inactive(&mut self) -> bool {
        debug_assert!(self.active.is_none());
        match self.inactive.pop_front() {
            Some(index) => {
                let buffer = &mut self.buffers[index];
                buffer.reset();
                buffer.state = BufferState::Active;
                self.active = Some(index);
                true
            }
            None => false,
        }
    }

    fn detach_active(&mut self) -> Option<FlushableBuffer> {
        let index = self.active.take()?;
        let (ops, notifier) = self.buffers[index].detach();
        Some(FlushableBuffer {
            index,
            ops,
            notifier,
        })
    }

    fn active_buffer(&mut self) -> &mut Buffer {
        let index = self.active.expect("no active buffer");
        &mut self.buffers[index]
    }

    /// The notification of some currently-flushing buffer, for throttling
    /// errors raised when every buffer is busy.
    fn flushing_notification(&self) -> FlushNotification {
        self.buffers
            .iter()
            .find(|b| b.state == BufferState::Flushing)
            .map(Buffer::flush_notification)
            .unwrap_or_else(FlushNotification::ready)
    }

    fn has_pending_operations(&self) -> bool {
        self.active
            .map(|index| !self.buffers[index].ops.is_empty())
            .unwrap_or(false)
            || self
                .buffers
                .iter()
                .any(|b| b.state == BufferState::Flushing)
    }
}

impl Session {
    /// Creates a session with default configuration: AUTO_FLUSH_SYNC,
    /// CLIENT_PROPAGATED consistency, 1000-operation buffers, a 0.5 low
    /// watermark and a one-second flush interval.
    pub fn new(transport: Arc<dyn WriteTransport>, router: Arc<dyn TabletRouter>) -> Session {
        let config = SessionConfig::default();
        Session {
            inner: Arc::new(SessionInner {
                transport,
                router,
                error_collector: ErrorCollector::new(config.mutation_buffer_space),
                config: Mutex::new(config),
                monitor: Mutex::new(Monitor::new()),
            }),
        }
    }

    /// Submits one operation.
    ///
    /// The row is frozen on success; the returned [`PendingOperation`]
    /// resolves once the operation's flush (or, in AUTO_FLUSH_SYNC, its own
    /// RPC) has completed. Row-level failures resolve the future with a
    /// response carrying a [`RowError`] rather than failing `apply`.
    pub fn apply(&mut self, mut operation: Operation) -> std::result::Result<PendingOperation, ApplyError> {
        let config = self.inner.config.lock().clone();

        if !operation.row().primary_key_is_set() {
            return Err(ApplyError::Rejected {
                operation: Box::new(operation),
                status: Error::InvalidArgument(
                    "primary key columns must be set and non-NULL".into(),
                ),
            });
        }
        let partition_key = match operation.partition_key() {
            Ok(key) => key,
            Err(status) => {
                return Err(ApplyError::Rejected {
                    operation: Box::new(operation),
                    status,
                })
            }
        };
        operation.freeze();

        match config.flush_mode {
            FlushMode::AutoFlushSync => self.apply_direct(operation, partition_key, &config),
            FlushMode::ManualFlush | FlushMode::AutoFlushBackground => {
                self.apply_buffered(operation, partition_key, &config)
            }
        }
    }

    /// AUTO_FLUSH_SYNC: no buffering, the operation goes straight out as a
    /// single-row batch.
    fn apply_direct(
        &self,
        mut operation: Operation,
        partition_key: Vec<u8>,
        config: &SessionConfig,
    ) -> std::result::Result<PendingOperation, ApplyError> {
        if self.inner.monitor.lock().closed {
            operation.thaw();
            return Err(ApplyError::Rejected {
                operation: Box::new(operation),
                status: Error::IllegalState("cannot apply, the session is closed".into()),
            });
        }

        let inner = self.inner.clone();
        let timeout = self.operation_timeout(config);
        let consistency = config.external_consistency_mode;
        let ignore_duplicate_rows = config.ignore_duplicate_rows;
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let deadline = Instant::now() + timeout;
            let table = operation.table().clone();
            let located = inner
                .router
                .locate_tablet(table.clone(), partition_key, deadline)
                .await;
            let response = match located {
                Err(err) => {
                    trace!(table = table.name(), "tablet lookup failed: {err}");
                    OperationResponse::failed(RowError::new(
                        err.into_row_status(),
                        operation,
                        None,
                    ))
                }
                Ok(tablet) => {
                    let mut batch =
                        Batch::new(table, tablet.id().to_string(), ignore_duplicate_rows);
                    batch.push(operation);
                    let mut responses = send_batch(&inner, batch, consistency, deadline).await;
                    responses
                        .pop()
                        .expect("a single-operation batch produces one response")
                }
            };
            let _ = tx.send(response);
        });

        Ok(PendingOperation::new(rx))
    }

    /// MANUAL_FLUSH and AUTO_FLUSH_BACKGROUND: admission into the active
    /// buffer under the monitor, then any triggered flush outside it.
    fn apply_buffered(
        &mut self,
        mut operation: Operation,
        partition_key: Vec<u8>,
        config: &SessionConfig,
    ) -> std::result::Result<PendingOperation, ApplyError> {
        let background = config.flush_mode == FlushMode::AutoFlushBackground;
        let space = config.mutation_buffer_space;
        let low_watermark = config.low_watermark();
        let (tx, rx) = oneshot::channel();

        let reject = |mut operation: Operation, status: Error| {
            operation.thaw();
            Err(ApplyError::Rejected {
                operation: Box::new(operation),
                status,
            })
        };
        let throttle = |mut operation: Operation, notification: FlushNotification| {
            operation.thaw();
            Err(ApplyError::Throttled {
                operation: Box::new(operation),
                notification,
            })
        };

        let mut to_flush = None;
        {
            let mut monitor = self.inner.monitor.lock();
            if monitor.closed {
                return reject(
                    operation,
                    Error::IllegalState("cannot apply, the session is closed".into()),
                );
            }

            // Make sure some buffer is accepting operations.
            if monitor.active.is_none() && !monitor.promote_inactive() {
                return throttle(operation, monitor.flushing_notification());
            }

            let size = monitor.active_buffer().ops.len();
            if size >= space {
                if !background {
                    return reject(
                        operation,
                        Error::IllegalState(
                            "MANUAL_FLUSH is enabled but the buffer is too big".into(),
                        ),
                    );
                }
                if monitor.inactive.is_empty() {
                    return throttle(operation, monitor.active_buffer().flush_notification());
                }
                to_flush = monitor.detach_active();
                let promoted = monitor.promote_inactive();
                debug_assert!(promoted);
            } else if background
                && low_watermark < space
                && size >= low_watermark
                && monitor.inactive.is_empty()
            {
                // Probabilistic early-flush admission: past the low
                // watermark, shed a growing fraction of producers so they
                // converge on the flush rate instead of hitting the hard
                // wall at `space`.
                let watermark = size + 1 + rand::rng().random_range(0..space - low_watermark);
                if watermark > space {
                    trace!(size, "throttling above the low watermark");
                    return throttle(operation, monitor.active_buffer().flush_notification());
                }
            }

            let deadline = Instant::now() + self.operation_timeout(config);
            let router = self.inner.router.clone();
            let table = operation.table().clone();
            let tablet_lookup =
                tokio::spawn(
                    async move { router.locate_tablet(table, partition_key, deadline).await },
                );
            monitor.active_buffer().ops.push(BufferedOperation {
                operation,
                completion: tx,
                tablet_lookup,
            });

            let size = monitor.active_buffer().ops.len();
            if background && size >= space && !monitor.inactive.is_empty() && to_flush.is_none() {
                // The append filled the buffer and a spare is ready; rotate
                // immediately rather than waiting for the timer.
                to_flush = monitor.detach_active();
            } else if background && size == 1 {
                let task_id = monitor.next_flush_task_id;
                monitor.next_flush_task_id += 1;
                monitor.active_buffer().flush_task_id = Some(task_id);
                spawn_flush_timer(Arc::downgrade(&self.inner), task_id, config.flush_interval);
            }
        }

        if let Some(buffer) = to_flush {
            trace!("flushing a full buffer");
            tokio::spawn(run_flush(self.inner.clone(), buffer));
        }
        Ok(PendingOperation::new(rx))
    }

    /// Flushes the active buffer and returns a future resolving to the
    /// flattened per-operation responses once this flush *and* any previously
    /// started ones have completed.
    pub fn flush(&self) -> BoxFuture<'static, Vec<OperationResponse>> {
        let inner = self.inner.clone();
        let (non_active, detached) = {
            let mut monitor = inner.monitor.lock();
            let non_active: Vec<FlushNotification> = (0..monitor.buffers.len())
                .filter(|index| monitor.active != Some(*index))
                .map(|index| monitor.buffers[index].flush_notification())
                .collect();
            (non_active, monitor.detach_active())
        };

        let active_flush =
            detached.map(|buffer| tokio::spawn(run_flush(inner.clone(), buffer)));

        async move {
            join_all(non_active).await;
            match active_flush {
                Some(handle) => handle.await.unwrap_or_else(|err| {
                    warn!("flush task failed: {err}");
                    Vec::new()
                }),
                None => Vec::new(),
            }
        }
        .boxed()
    }

    /// Marks the session closed and flushes whatever is buffered. Idempotent;
    /// `apply` fails from the first call onward.
    pub fn close(&self) -> BoxFuture<'static, Vec<OperationResponse>> {
        {
            let mut monitor = self.inner.monitor.lock();
            if !monitor.closed {
                debug!("closing session");
                monitor.closed = true;
            }
        }
        self.flush()
    }

    /// Whether any operation is buffered or part of an in-flight flush.
    pub fn has_pending_operations(&self) -> bool {
        self.inner.monitor.lock().has_pending_operations()
    }

    /// Number of row errors collected by background flushes since the last
    /// [`get_pending_errors`](Session::get_pending_errors).
    pub fn count_pending_errors(&self) -> usize {
        self.inner.error_collector.count()
    }

    /// Drains the collected row errors. The flag reports whether the
    /// collector overflowed and dropped errors since the last drain.
    pub fn get_pending_errors(&self) -> (Vec<RowError>, bool) {
        self.inner.error_collector.take_all()
    }

    fn operation_timeout(&self, config: &SessionConfig) -> Duration {
        config
            .timeout
            .unwrap_or_else(|| self.inner.transport.default_operation_timeout())
    }

    fn update_config(&self, update: impl FnOnce(&mut SessionConfig)) -> Result<()> {
        // Config is snapshotted at apply and flush time; changing it under
        // pending operations would make a generation half-old, half-new.
        let mut config = self.inner.config.lock();
        if self.inner.monitor.lock().has_pending_operations() {
            return Err(Error::IllegalState(
                "cannot change the configuration while operations are pending".into(),
            ));
        }
        update(&mut config);
        Ok(())
    }

    pub fn set_flush_mode(&self, mode: FlushMode) -> Result<()> {
        self.update_config(|config| config.flush_mode = mode)
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.inner.config.lock().flush_mode
    }

    pub fn set_external_consistency_mode(&self, mode: ExternalConsistencyMode) -> Result<()> {
        self.update_config(|config| config.external_consistency_mode = mode)
    }

    pub fn external_consistency_mode(&self) -> ExternalConsistencyMode {
        self.inner.config.lock().external_consistency_mode
    }

    /// Sets the per-buffer operation capacity. Also re-sizes (and clears) the
    /// pending-error collector.
    pub fn set_mutation_buffer_space(&self, space: usize) -> Result<()> {
        if space == 0 {
            return Err(Error::InvalidArgument(
                "mutation buffer space must be at least 1".into(),
            ));
        }
        self.update_config(|config| config.mutation_buffer_space = space)?;
        self.inner.error_collector.reset_capacity(space);
        Ok(())
    }

    pub fn mutation_buffer_space(&self) -> usize {
        self.inner.config.lock().mutation_buffer_space
    }

    /// Sets the buffer fill fraction past which background applies become
    /// probabilistically throttled. 1.0 disables early throttling; 0.0 arms
    /// it whenever no spare buffer is available.
    pub fn set_mutation_buffer_low_watermark(&self, percentage: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&percentage) {
            return Err(Error::InvalidArgument(format!(
                "watermark percentage must be between 0 and 1, got {percentage}"
            )));
        }
        self.update_config(|config| config.low_watermark_percentage = percentage)
    }

    pub fn mutation_buffer_low_watermark(&self) -> f64 {
        self.inner.config.lock().low_watermark_percentage
    }

    pub fn set_flush_interval(&self, interval: Duration) -> Result<()> {
        self.update_config(|config| config.flush_interval = interval)
    }

    pub fn flush_interval(&self) -> Duration {
        self.inner.config.lock().flush_interval
    }

    /// Sets the operation deadline: per operation in AUTO_FLUSH_SYNC, per
    /// batch at flush time otherwise. Unset, the transport's default applies.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.update_config(|config| config.timeout = Some(timeout))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.config.lock().timeout
    }

    /// When set, AlreadyPresent row errors are silently treated as successes.
    pub fn set_ignore_duplicate_rows(&self, ignore: bool) -> Result<()> {
        self.update_config(|config| config.ignore_duplicate_rows = ignore)
    }

    pub fn ignore_duplicate_rows(&self) -> bool {
        self.inner.config.lock().ignore_duplicate_rows
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let monitor = self.inner.monitor.lock();
        f.debug_struct("Session")
            .field("buffers", &monitor.buffers)
            .field("active", &monitor.active)
            .field("closed", &monitor.closed)
            .finish()
    }
}

/// Schedules the background flush of the buffer that stored `task_id`. The
/// timer holds the session weakly: an abandoned session must not be kept
/// alive by its timers.
fn spawn_flush_timer(inner: Weak<SessionInner>, task_id: u64, interval: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let detached = {
            let mut monitor = inner.monitor.lock();
            match monitor.active {
                Some(index) if monitor.buffers[index].flush_task_id == Some(task_id) => {
                    monitor.detach_active()
                }
                _ => {
                    // The buffer this timer was armed for has already been
                    // flushed (manually or by filling up).
                    trace!(task_id, "flush timer superseded");
                    None
                }
            }
        };
        if let Some(buffer) = detached {
            trace!(task_id, "timed flush");
            run_flush(inner, buffer).await;
        }
    });
}

/// Flushes one detached buffer generation: joins the tablet lookups, groups
/// operations by tablet, sends one batch per tablet, fans responses out to
/// completions and the error collector, fires the generation's notification,
/// and returns the buffer to the inactive pool.
async fn run_flush(
    inner: Arc<SessionInner>,
    buffer: FlushableBuffer,
) -> Vec<OperationResponse> {
    let config = inner.config.lock().clone();
    let background = config.flush_mode == FlushMode::AutoFlushBackground;
    let timeout = config
        .timeout
        .unwrap_or_else(|| inner.transport.default_operation_timeout());
    let deadline = Instant::now() + timeout;
    let num_ops = buffer.ops.len();
    debug!(ops = num_ops, "flushing buffer");

    let mut responses: Vec<Option<OperationResponse>> = (0..num_ops).map(|_| None).collect();
    let mut completions = Vec::with_capacity(num_ops);
    let mut located = Vec::with_capacity(num_ops);

    // Join this generation's tablet lookups. Operations whose lookup failed
    // get their response synthesized right here and never reach a batch.
    for (index, buffered) in buffer.ops.into_iter().enumerate() {
        completions.push(buffered.completion);
        let resolved = match buffered.tablet_lookup.await {
            Ok(Ok(tablet)) => Ok(tablet),
            Ok(Err(err)) => Err(err.into_row_status()),
            Err(join_err) => Err(Error::Runtime(format!(
                "tablet lookup task failed: {join_err}"
            ))),
        };
        match resolved {
            Ok(tablet) => {
                located.push((tablet.id().to_string(), (index, buffered.operation)))
            }
            Err(status) => {
                trace!(row = index, "tablet lookup failed: {status}");
                responses[index] = Some(OperationResponse::failed(RowError::new(
                    status,
                    buffered.operation,
                    None,
                )));
            }
        }
    }

    // One batch per tablet, preserving submission order within each.
    let batches = located
        .into_iter()
        .into_group_map()
        .into_iter()
        .map(|(tablet_id, group)| {
            let table = group[0].1.table().clone();
            let mut batch = Batch::new(table, tablet_id, config.ignore_duplicate_rows);
            let mut indices = Vec::with_capacity(group.len());
            for (index, operation) in group {
                indices.push(index);
                batch.push(operation);
            }
            let inner = inner.clone();
            let consistency = config.external_consistency_mode;
            async move {
                let batch_responses = send_batch(&inner, batch, consistency, deadline).await;
                (indices, batch_responses)
            }
        });

    for (indices, batch_responses) in join_all(batches).await {
        for (index, response) in indices.into_iter().zip(batch_responses) {
            responses[index] = Some(response);
        }
    }

    // Fan out in submission order: error collector (background mode only),
    // per-operation completions, and the flattened flush result.
    let mut flattened = Vec::with_capacity(num_ops);
    for (response, completion) in responses.into_iter().zip(completions) {
        let response = response.expect("every operation resolves to a response");
        if background {
            if let Some(error) = response.row_error() {
                inner.error_collector.add(error.clone());
            }
        }
        let _ = completion.send(response.clone());
        flattened.push(response);
    }

    // End of generation: wake throttled producers, then return the buffer to
    // the rotation.
    buffer.notifier.notify();
    {
        let mut monitor = inner.monitor.lock();
        monitor.buffers[buffer.index].requeue();
        monitor.inactive.push_back(buffer.index);
    }
    debug!(ops = num_ops, "buffer flushed");
    flattened
}

/// Sends one batch and classifies the outcome. A successful response with a
/// positive write timestamp feeds the transport's propagated timestamp.
async fn send_batch(
    inner: &SessionInner,
    batch: Batch,
    consistency: ExternalConsistencyMode,
    deadline: Instant,
) -> Vec<OperationResponse> {
    let request = match batch.to_write_request(
        consistency,
        inner.transport.last_propagated_timestamp(),
        deadline,
    ) {
        Ok(request) => request,
        Err(status) => return batch.fail_all(status),
    };
    trace!(tablet = batch.tablet_id(), ops = batch.len(), "sending write rpc");
    match inner.transport.send(request).await {
        Ok(response) => {
            if response.write_timestamp > 0 {
                inner
                    .transport
                    .update_last_propagated_timestamp(response.write_timestamp);
            }
            batch.classify_response(response)
        }
        Err(status) => {
            warn!(tablet = batch.tablet_id(), "write rpc failed: {status}");
            batch.fail_all(status)
        }
    }
}
