//! Session buffers and per-generation flush notifications.
//!
//! A session owns exactly two buffers. Each cycles inactive → active →
//! flushing → inactive; one full cycle is a *generation*. The buffer's flush
//! notification fires exactly once per generation, strictly after every
//! batch of that generation has completed, and is the signal carried by
//! throttling errors so producers can wait for capacity without busy-looping.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::operation::{Operation, OperationResponse};
use crate::router::{LocateError, LocatedTablet};

/// A clonable future that resolves when a buffer generation's flush has
/// completed. Already-resolved for a buffer that is sitting idle.
#[derive(Clone)]
pub struct FlushNotification {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl FlushNotification {
    /// A fresh notification and the handle that fires it.
    pub(crate) fn pair() -> (FlushNotifier, FlushNotification) {
        let (tx, rx) = oneshot::channel::<()>();
        let inner = async move {
            // Either the notifier fired or it was dropped with its flush
            // task; both mean this generation is over.
            let _ = rx.await;
        }
        .boxed()
        .shared();
        (FlushNotifier(tx), FlushNotification { inner })
    }

    /// An already-fired notification.
    pub(crate) fn ready() -> FlushNotification {
        FlushNotification {
            inner: futures_util::future::ready(()).boxed().shared(),
        }
    }

    fn is_complete(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl Future for FlushNotification {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for FlushNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushNotification")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Fires the paired [`FlushNotification`]. Consumed by the flush task at the
/// end of the generation.
#[derive(Debug)]
pub(crate) struct FlushNotifier(oneshot::Sender<()>);

impl FlushNotifier {
    pub(crate) fn notify(self) {
        let _ = self.0.send(());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferState {
    Inactive,
    Active,
    Flushing,
}

/// An operation waiting in a buffer alongside its in-flight tablet lookup.
#[derive(Debug)]
pub(crate) struct BufferedOperation {
    pub(crate) operation: Operation,
    pub(crate) completion: oneshot::Sender<OperationResponse>,
    pub(crate) tablet_lookup: JoinHandle<Result<LocatedTablet, LocateError>>,
}

/// One of the session's two operation buffers.
pub(crate) struct Buffer {
    pub(crate) state: BufferState,
    pub(crate) ops: Vec<BufferedOperation>,
    notifier: Option<FlushNotifier>,
    notification: FlushNotification,
    /// Identity of the scheduled flush task for the current generation; a
    /// timer only acts if its own identity is still stored here.
    pub(crate) flush_task_id: Option<u64>,
}

impl Buffer {
    /// A new buffer starts inactive with an already-fired notification, as if
    /// a previous generation had just completed.
    pub(crate) fn new() -> Buffer {
        Buffer {
            state: BufferState::Inactive,
            ops: Vec::new(),
            notifier: None,
            notification: FlushNotification::ready(),
            flush_task_id: None,
        }
    }

    /// The current generation's notification.
    pub(crate) fn flush_notification(&self) -> FlushNotification {
        self.notification.clone()
    }

    /// Begins a new generation: clears operations, installs a fresh
    /// notification, clears the flush-task identity. Called on promotion to
    /// active.
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.ops.is_empty(), "reset of a non-empty buffer");
        self.ops.clear();
        let (notifier, notification) = FlushNotification::pair();
        self.notifier = Some(notifier);
        self.notification = notification;
        self.flush_task_id = None;
    }

    /// Detaches the generation's operations and notifier for flushing. The
    /// buffer stays parked in the flushing state until
    /// [`Buffer::requeue`].
    pub(crate) fn detach(&mut self) -> (Vec<BufferedOperation>, FlushNotifier) {
        debug_assert_eq!(self.state, BufferState::Active);
        self.state = BufferState::Flushing;
        self.flush_task_id = None;
        let ops = std::mem::take(&mut self.ops);
        let notifier = self
            .notifier
            .take()
            .expect("active buffer is missing its flush notifier");
        (ops, notifier)
    }

    /// Returns the buffer to the inactive pool after its flush completed.
    pub(crate) fn requeue(&mut self) {
        debug_assert_eq!(self.state, BufferState::Flushing);
        debug_assert!(self.ops.is_empty());
        self.state = BufferState::Inactive;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("state", &self.state)
            .field("ops", &self.ops.len())
            .field("flush_task_id", &self.flush_task_id)
            .finish()
    }
}
