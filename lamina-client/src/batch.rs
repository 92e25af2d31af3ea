//! Per-tablet operation batches.
//!
//! During a flush, the session groups a buffer generation's operations by
//! owning tablet; each group becomes one [`Batch`], which produces exactly
//! one write request and classifies the per-row outcome of its response.

use std::collections::HashMap;
use std::sync::Arc;

use lamina_data::row_operations::{encode_row_operations, RowOperation};
use lamina_errors::{illegal_state_err, Error, Result};
use tokio::time::Instant;
use tracing::warn;

use crate::config::ExternalConsistencyMode;
use crate::operation::{Operation, OperationResponse, RowError};
use crate::table::Table;
use crate::transport::{WriteRequest, WriteResponse};

/// Operations bound for one tablet, in submission order.
#[derive(Debug)]
pub(crate) struct Batch {
    table: Arc<Table>,
    tablet_id: String,
    operations: Vec<Operation>,
    ignore_duplicate_rows: bool,
}

impl Batch {
    pub(crate) fn new(
        table: Arc<Table>,
        tablet_id: String,
        ignore_duplicate_rows: bool,
    ) -> Batch {
        Batch {
            table,
            tablet_id,
            operations: Vec::new(),
            ignore_duplicate_rows,
        }
    }

    pub(crate) fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub(crate) fn len(&self) -> usize {
        self.operations.len()
    }

    pub(crate) fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    /// Encodes the batch into the single write request it is sent as.
    pub(crate) fn to_write_request(
        &self,
        external_consistency_mode: ExternalConsistencyMode,
        propagated_timestamp: Option<u64>,
        deadline: Instant,
    ) -> Result<WriteRequest> {
        let row_operations: Vec<RowOperation> = self
            .operations
            .iter()
            .map(|op| RowOperation::new(op.op_type(), op.row().clone()))
            .collect();
        let row_operations = encode_row_operations(row_operations.iter())?
            .ok_or_else(|| illegal_state_err!("cannot send an empty batch"))?;
        Ok(WriteRequest {
            table_id: self.table.id().to_string(),
            tablet_id: self.tablet_id.clone(),
            row_operations,
            external_consistency_mode,
            propagated_timestamp,
            deadline,
        })
    }

    /// Fans a response out to one [`OperationResponse`] per operation, in
    /// submission order. `AlreadyPresent` row errors are treated as successes
    /// when the batch was created with `ignore_duplicate_rows`.
    pub(crate) fn classify_response(self, response: WriteResponse) -> Vec<OperationResponse> {
        let mut row_errors: HashMap<usize, Error> = HashMap::new();
        for per_row in response.per_row_errors {
            if per_row.row_index >= self.operations.len() {
                warn!(
                    tablet = %self.tablet_id,
                    row_index = per_row.row_index,
                    "server reported an error for a row index outside the batch"
                );
                continue;
            }
            row_errors.insert(per_row.row_index, per_row.status);
        }

        let tserver_uuid = Some(response.tserver_uuid);
        self.operations
            .into_iter()
            .enumerate()
            .map(|(idx, operation)| match row_errors.remove(&idx) {
                Some(status) if self.ignore_duplicate_rows && status.is_already_present() => {
                    OperationResponse::ok(response.write_timestamp, tserver_uuid.clone())
                }
                Some(status) => OperationResponse::failed(RowError::new(
                    status,
                    operation,
                    tserver_uuid.clone(),
                )),
                None => OperationResponse::ok(response.write_timestamp, tserver_uuid.clone()),
            })
            .collect()
    }

    /// The whole batch failed: every operation gets a synthetic response
    /// carrying the shared status.
    pub(crate) fn fail_all(self, status: Error) -> Vec<OperationResponse> {
        self.operations
            .into_iter()
            .map(|operation| {
                OperationResponse::failed(RowError::new(status.clone(), operation, None))
            })
            .collect()
    }
}
