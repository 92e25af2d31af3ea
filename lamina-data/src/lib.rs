//! Data model and wire codecs for the Lamina client: column types, schemas,
//! partially-specified rows, the binary row-operations codec, and
//! partition-key computation.

mod bitset;
pub mod partition;
pub mod row;
pub mod row_operations;
pub mod schema;
pub mod types;

pub use partition::{HashBucketSchema, Partition, PartitionSchema, RangeSchema};
pub use row::PartialRow;
pub use row_operations::{
    decode_row_operations, encode_row_operations, RowOperation, RowOperationType, RowOperations,
};
pub use schema::{ColumnSchema, Schema, SchemaBuilder};
pub use types::DataType;
