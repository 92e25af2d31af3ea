//! Row operations, their responses, and the one-shot completion future
//! handed back by `apply`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use lamina_data::row::PartialRow;
use lamina_data::row_operations::RowOperationType;
use lamina_errors::{Error, Result};
use tokio::sync::oneshot;

use crate::table::Table;

/// A single row mutation bound for a table.
///
/// Constructed through [`Operation::insert`] and friends, filled in through
/// [`row_mut`](Operation::row_mut), and consumed by
/// [`Session::apply`](crate::session::Session::apply). Once submitted the row
/// is frozen; any later mutation attempt fails with
/// [`Error::IllegalState`].
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    table: Arc<Table>,
    op_type: RowOperationType,
    row: PartialRow,
}

impl Operation {
    fn new(table: Arc<Table>, op_type: RowOperationType) -> Operation {
        debug_assert!(op_type.is_row_change());
        let row = PartialRow::new(table.schema().clone());
        Operation {
            table,
            op_type,
            row,
        }
    }

    /// Creates an INSERT against `table`.
    pub fn insert(table: &Arc<Table>) -> Operation {
        Operation::new(table.clone(), RowOperationType::Insert)
    }

    /// Creates an UPDATE against `table`.
    pub fn update(table: &Arc<Table>) -> Operation {
        Operation::new(table.clone(), RowOperationType::Update)
    }

    /// Creates an UPSERT against `table`.
    pub fn upsert(table: &Arc<Table>) -> Operation {
        Operation::new(table.clone(), RowOperationType::Upsert)
    }

    /// Creates a DELETE against `table`.
    pub fn delete(table: &Arc<Table>) -> Operation {
        Operation::new(table.clone(), RowOperationType::Delete)
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn op_type(&self) -> RowOperationType {
        self.op_type
    }

    pub fn row(&self) -> &PartialRow {
        &self.row
    }

    pub fn row_mut(&mut self) -> &mut PartialRow {
        &mut self.row
    }

    pub(crate) fn freeze(&mut self) {
        self.row.freeze();
    }

    pub(crate) fn thaw(&mut self) {
        self.row.thaw();
    }

    /// The partition key routing this operation to its owning tablet.
    pub(crate) fn partition_key(&self) -> Result<Vec<u8>> {
        self.table
            .partition_schema()
            .encode_partition_key(&self.row)
    }
}

/// The error attached to a single failed row.
#[derive(Debug, Clone)]
pub struct RowError {
    status: Error,
    operation: Box<Operation>,
    tserver_uuid: Option<String>,
}

impl RowError {
    pub(crate) fn new(
        status: Error,
        operation: Operation,
        tserver_uuid: Option<String>,
    ) -> RowError {
        RowError {
            status,
            operation: Box::new(operation),
            tserver_uuid,
        }
    }

    pub fn status(&self) -> &Error {
        &self.status
    }

    /// The operation that failed, for inspection or resubmission.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn into_operation(self) -> Operation {
        *self.operation
    }

    /// UUID of the tablet server that reported the error, when one did.
    pub fn tserver_uuid(&self) -> Option<&str> {
        self.tserver_uuid.as_deref()
    }
}

/// The outcome of one operation: the server-assigned write timestamp, the
/// responding tablet server, and the row error if the row failed.
#[derive(Debug, Clone, Default)]
pub struct OperationResponse {
    write_timestamp: u64,
    tserver_uuid: Option<String>,
    row_error: Option<RowError>,
}

impl OperationResponse {
    pub(crate) fn ok(write_timestamp: u64, tserver_uuid: Option<String>) -> OperationResponse {
        OperationResponse {
            write_timestamp,
            tserver_uuid,
            row_error: None,
        }
    }

    pub(crate) fn failed(row_error: RowError) -> OperationResponse {
        OperationResponse {
            write_timestamp: 0,
            tserver_uuid: row_error.tserver_uuid.clone(),
            row_error: Some(row_error),
        }
    }

    pub fn write_timestamp(&self) -> u64 {
        self.write_timestamp
    }

    pub fn tserver_uuid(&self) -> Option<&str> {
        self.tserver_uuid.as_deref()
    }

    pub fn has_row_error(&self) -> bool {
        self.row_error.is_some()
    }

    pub fn row_error(&self) -> Option<&RowError> {
        self.row_error.as_ref()
    }

    pub fn into_row_error(self) -> Option<RowError> {
        self.row_error
    }
}

/// Completion future for an applied operation.
///
/// Resolves once the operation's buffer generation has flushed (or, in
/// AUTO_FLUSH_SYNC, once its own RPC has completed). Row failures resolve to
/// an `Ok` response carrying a [`RowError`]; `Err` is reserved for the
/// session being torn down before a response was produced.
#[derive(Debug)]
pub struct PendingOperation {
    rx: oneshot::Receiver<OperationResponse>,
}

impl PendingOperation {
    pub(crate) fn new(rx: oneshot::Receiver<OperationResponse>) -> PendingOperation {
        PendingOperation { rx }
    }
}

impl Future for PendingOperation {
    type Output = Result<OperationResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.map_err(|_| {
                Error::Aborted("the session was torn down before the operation completed".into())
            })
        })
    }
}
