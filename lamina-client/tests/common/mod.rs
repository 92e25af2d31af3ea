//! In-process cluster harness: a tablet router over a static partition map
//! and a write transport that decodes row-operations payloads and tracks row
//! keys per tablet, so duplicate-key and missing-row behavior is exercised
//! end to end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lamina_client::{
    LocateError, LocatedTablet, PerRowError, Table, TabletRouter, WriteRequest, WriteResponse,
    WriteTransport,
};
use lamina_data::partition::encode_ordered_columns;
use lamina_data::row_operations::{decode_row_operations, RowOperationType};
use lamina_data::schema::{ColumnSchema, SchemaBuilder};
use lamina_data::types::DataType;
use lamina_data::{Partition, PartialRow, PartitionSchema};
use lamina_errors::{Error, Result};
use parking_lot::Mutex;
use tokio::time::Instant;

/// The `{key INT32 PK, val STRING NULL}` table used throughout the tests,
/// range-partitioned on `key`.
pub fn test_table() -> Arc<Table> {
    let schema = Arc::new(
        SchemaBuilder::new()
            .add_column(ColumnSchema::new("key", DataType::Int32))
            .add_column(ColumnSchema::new("val", DataType::String).nullable())
            .primary_key(["key"])
            .build()
            .unwrap(),
    );
    Arc::new(Table::new("test-table-id", "test_table", schema, PartitionSchema::range_over(vec![0])).unwrap())
}

/// The partition key owning `key` in [`test_table`].
pub fn partition_key(table: &Arc<Table>, key: i32) -> Vec<u8> {
    let mut row = PartialRow::new(table.schema().clone());
    row.set(0, key).unwrap();
    table.partition_schema().encode_partition_key(&row).unwrap()
}

/// One write RPC observed by the cluster.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub tablet_id: String,
    pub num_ops: usize,
    pub propagated_timestamp: Option<u64>,
}

#[derive(Default)]
struct ClusterState {
    /// Primary keys present, per tablet.
    rows: HashMap<String, HashSet<Vec<u8>>>,
    requests: Vec<RecordedRequest>,
}

/// An in-process stand-in for the masters and tablet servers.
pub struct MockCluster {
    table: Arc<Table>,
    tablets: Vec<LocatedTablet>,
    state: Mutex<ClusterState>,
    clock: AtomicU64,
    propagated: Mutex<Option<u64>>,
    send_delay: Mutex<Option<Duration>>,
    fail_sends: Mutex<Option<Error>>,
}

impl MockCluster {
    /// A cluster whose single tablet covers the whole key space.
    pub fn single_tablet(table: Arc<Table>) -> Arc<MockCluster> {
        MockCluster::with_tablets(
            table,
            vec![LocatedTablet::new("tablet-0", Partition::unbounded(), None)],
        )
    }

    pub fn with_tablets(table: Arc<Table>, tablets: Vec<LocatedTablet>) -> Arc<MockCluster> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Arc::new(MockCluster {
            table,
            tablets,
            state: Mutex::default(),
            clock: AtomicU64::new(0),
            propagated: Mutex::default(),
            send_delay: Mutex::default(),
            fail_sends: Mutex::default(),
        })
    }

    /// Adds latency to every write RPC.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    /// Makes every write RPC fail wholesale until cleared.
    pub fn fail_sends(&self, error: Error) {
        *self.fail_sends.lock() = Some(error);
    }

    pub fn clear_send_failure(&self) {
        *self.fail_sends.lock() = None;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn contains_row(&self, key: i32) -> bool {
        let encoded = primary_key_bytes(&self.table, key);
        self.state
            .lock()
            .rows
            .values()
            .any(|rows| rows.contains(&encoded))
    }

    pub fn last_propagated(&self) -> Option<u64> {
        *self.propagated.lock()
    }
}

fn primary_key_bytes(table: &Arc<Table>, key: i32) -> Vec<u8> {
    let mut row = PartialRow::new(table.schema().clone());
    row.set(0, key).unwrap();
    encode_primary_key(&row)
}

fn encode_primary_key(row: &PartialRow) -> Vec<u8> {
    let key_columns: Vec<usize> = (0..row.schema().num_key_columns()).collect();
    let mut encoded = Vec::new();
    encode_ordered_columns(row, &key_columns, &mut encoded).unwrap();
    encoded
}

#[async_trait]
impl TabletRouter for MockCluster {
    async fn locate_tablet(
        &self,
        _table: Arc<Table>,
        partition_key: Vec<u8>,
        _deadline: Instant,
    ) -> std::result::Result<LocatedTablet, LocateError> {
        self.tablets
            .iter()
            .find(|tablet| tablet.partition().covers(&partition_key))
            .cloned()
            .ok_or(LocateError::NonCoveredRange)
    }
}

#[async_trait]
impl WriteTransport for MockCluster {
    async fn send(&self, request: WriteRequest) -> Result<WriteResponse> {
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_sends.lock().clone() {
            return Err(error);
        }

        let ops = decode_row_operations(self.table.schema(), &request.row_operations)?;
        let mut state = self.state.lock();
        state.requests.push(RecordedRequest {
            tablet_id: request.tablet_id.clone(),
            num_ops: ops.len(),
            propagated_timestamp: request.propagated_timestamp,
        });

        let rows = state.rows.entry(request.tablet_id.clone()).or_default();
        let mut per_row_errors = Vec::new();
        for (row_index, op) in ops.iter().enumerate() {
            let key = encode_primary_key(&op.row);
            let error = match op.op_type {
                RowOperationType::Insert => {
                    if rows.contains(&key) {
                        Some(Error::AlreadyPresent("key already present".into()))
                    } else {
                        rows.insert(key);
                        None
                    }
                }
                RowOperationType::Upsert => {
                    rows.insert(key);
                    None
                }
                RowOperationType::Update => (!rows.contains(&key))
                    .then(|| Error::NotFound("key not found".into())),
                RowOperationType::Delete => {
                    (!rows.remove(&key)).then(|| Error::NotFound("key not found".into()))
                }
                other => Some(Error::InvalidArgument(format!(
                    "unexpected change type {other:?} in a write request"
                ))),
            };
            if let Some(status) = error {
                per_row_errors.push(PerRowError { row_index, status });
            }
        }

        Ok(WriteResponse {
            write_timestamp: self.clock.fetch_add(1, Ordering::SeqCst) + 1,
            tserver_uuid: format!("ts-{}", request.tablet_id),
            per_row_errors,
            ..WriteResponse::default()
        })
    }

    fn update_last_propagated_timestamp(&self, timestamp: u64) {
        let mut propagated = self.propagated.lock();
        *propagated = Some(propagated.map_or(timestamp, |current| current.max(timestamp)));
    }

    fn last_propagated_timestamp(&self) -> Option<u64> {
        *self.propagated.lock()
    }

    fn default_operation_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}
