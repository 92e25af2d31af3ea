//! The tablet-location contract.
//!
//! The session treats tablet location as a pure async dependency: every
//! applied operation gets its own lookup, started at apply time and joined
//! during flush. The production implementation is a cache over the cluster
//! masters; tests use an in-process map.

use std::sync::Arc;

use async_trait::async_trait;
use lamina_data::Partition;
use lamina_errors::Error;
use thiserror::Error;
use tokio::time::Instant;

use crate::table::Table;

/// A tablet resolved from a partition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedTablet {
    id: String,
    partition: Partition,
    leader_uuid: Option<String>,
}

impl LocatedTablet {
    pub fn new(
        id: impl Into<String>,
        partition: Partition,
        leader_uuid: Option<String>,
    ) -> LocatedTablet {
        LocatedTablet {
            id: id.into(),
            partition,
            leader_uuid,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// UUID of the leader replica's tablet server, if known.
    pub fn leader_uuid(&self) -> Option<&str> {
        self.leader_uuid.as_deref()
    }
}

/// Why a tablet lookup failed.
#[derive(Debug, Clone, Error)]
pub enum LocateError {
    /// The partition key lies outside every tablet's range.
    #[error("no tablet covers the partition key")]
    NonCoveredRange,

    #[error("tablet lookup timed out: {0}")]
    TimedOut(String),

    #[error("tablet lookup transport failure: {0}")]
    Transport(String),

    #[error("no master is available: {0}")]
    MasterUnavailable(String),
}

impl LocateError {
    /// The row-level status surfaced to the operation that needed this
    /// lookup: NotFound for a non-covered range, a generic runtime error for
    /// everything else.
    pub(crate) fn into_row_status(self) -> Error {
        match self {
            LocateError::NonCoveredRange => {
                Error::NotFound("no tablet covers the partition key".into())
            }
            other => Error::Runtime(other.to_string()),
        }
    }
}

/// Resolves partition keys to tablets.
#[async_trait]
pub trait TabletRouter: Send + Sync + 'static {
    async fn locate_tablet(
        &self,
        table: Arc<Table>,
        partition_key: Vec<u8>,
        deadline: Instant,
    ) -> Result<LocatedTablet, LocateError>;
}
