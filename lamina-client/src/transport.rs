//! The write-RPC transport contract.
//!
//! The transport owns framing, multiplexing, reconnection and retry policy;
//! the session only hands it fully-formed write requests and interprets the
//! responses. It is also the keeper of the last propagated timestamp used by
//! CLIENT_PROPAGATED reads.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lamina_data::RowOperations;
use lamina_errors::{Error, Result};
use tokio::time::Instant;

use crate::config::ExternalConsistencyMode;

/// One batched write bound for a single tablet.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub table_id: String,
    pub tablet_id: String,
    pub row_operations: RowOperations,
    pub external_consistency_mode: ExternalConsistencyMode,
    pub propagated_timestamp: Option<u64>,
    pub deadline: Instant,
}

impl WriteRequest {
    /// The tablet-server service this request is addressed to.
    pub const SERVICE_NAME: &'static str = "Write";
}

/// A row that the server failed, by its index in the request batch.
#[derive(Debug, Clone)]
pub struct PerRowError {
    pub row_index: usize,
    pub status: Error,
}

/// Auxiliary byte blobs appended to a response frame, addressed by index.
#[derive(Debug, Clone, Default)]
pub struct Sidecars(Vec<Bytes>);

impl Sidecars {
    pub fn new(sidecars: Vec<Bytes>) -> Sidecars {
        Sidecars(sidecars)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolves a sidecar index from a response header.
    pub fn get(&self, index: usize) -> Result<&Bytes> {
        if index >= self.0.len() {
            return Err(Error::Serialization(format!(
                "sidecar index {index} out of bounds ({} sidecars)",
                self.0.len()
            )));
        }
        Ok(&self.0[index])
    }
}

/// A tablet server's reply to a [`WriteRequest`].
#[derive(Debug, Clone, Default)]
pub struct WriteResponse {
    /// The timestamp the server assigned to the write; 0 if none.
    pub write_timestamp: u64,
    /// UUID of the responding tablet server.
    pub tserver_uuid: String,
    pub per_row_errors: Vec<PerRowError>,
    pub sidecars: Sidecars,
}

/// The write client consumed by sessions.
///
/// `send` resolving to `Err` means the batch as a whole failed (the request
/// never reached a tablet server, or the server rejected it outright);
/// per-row failures come back inside an `Ok` response.
#[async_trait]
pub trait WriteTransport: Send + Sync + 'static {
    async fn send(&self, request: WriteRequest) -> Result<WriteResponse>;

    /// Records a write timestamp observed from a successful response, for
    /// propagation with subsequent requests.
    fn update_last_propagated_timestamp(&self, timestamp: u64);

    fn last_propagated_timestamp(&self) -> Option<u64>;

    /// The per-operation deadline used when the session has no explicit
    /// timeout configured.
    fn default_operation_timeout(&self) -> Duration;
}
