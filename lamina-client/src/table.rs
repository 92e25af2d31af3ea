//! Table descriptors.

use std::sync::Arc;

use lamina_data::schema::Schema;
use lamina_data::PartitionSchema;
use lamina_errors::{invalid_argument, Result};

/// A handle to a table: identity, schema, and partition scheme. Shared by
/// every operation targeting the table.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    id: String,
    name: String,
    schema: Arc<Schema>,
    partition_schema: PartitionSchema,
}

impl Table {
    /// Creates a descriptor. Every column referenced by the partition scheme
    /// must be a primary-key column, so that any operation with a complete
    /// key can be routed.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        schema: Arc<Schema>,
        partition_schema: PartitionSchema,
    ) -> Result<Table> {
        for idx in partition_schema.referenced_columns() {
            if idx >= schema.num_key_columns() {
                invalid_argument!(
                    "partition column {idx} is not part of the table's primary key"
                );
            }
        }
        Ok(Table {
            id: id.into(),
            name: name.into(),
            schema,
            partition_schema,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn partition_schema(&self) -> &PartitionSchema {
        &self.partition_schema
    }
}
