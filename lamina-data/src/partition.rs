//! Partition schemas and partition-key computation.
//!
//! A row's partition key is the concatenation of its hash-bucket ids (one
//! big-endian 4-byte group id per hash component) and the order-preserving
//! encoding of the range-partition columns. Tablets own contiguous,
//! byte-wise-lexicographic ranges of partition keys.

use lamina_errors::{invalid_argument, Result};

use crate::row::PartialRow;
use crate::types::DataType;

/// One hash component: a set of key columns hashed into `num_buckets` groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashBucketSchema {
    columns: Vec<usize>,
    num_buckets: u32,
    seed: u32,
}

impl HashBucketSchema {
    pub fn new(columns: Vec<usize>, num_buckets: u32, seed: u32) -> Result<HashBucketSchema> {
        if columns.is_empty() {
            invalid_argument!("a hash component requires at least one column");
        }
        if num_buckets < 2 {
            invalid_argument!("a hash component requires at least two buckets");
        }
        Ok(HashBucketSchema {
            columns,
            num_buckets,
            seed,
        })
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    fn bucket_for(&self, row: &PartialRow) -> Result<u32> {
        let mut encoded = Vec::new();
        encode_ordered_columns(row, &self.columns, &mut encoded)?;
        Ok((murmur2_64(&encoded, self.seed as u64) % self.num_buckets as u64) as u32)
    }
}

/// The range component: key columns whose ordered encoding forms the tail of
/// the partition key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSchema {
    columns: Vec<usize>,
}

impl RangeSchema {
    pub fn new(columns: Vec<usize>) -> RangeSchema {
        RangeSchema { columns }
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }
}

/// A table's partition scheme: zero or more hash components followed by an
/// optional range component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSchema {
    hash_bucket_schemas: Vec<HashBucketSchema>,
    range_schema: RangeSchema,
}

impl PartitionSchema {
    pub fn new(
        hash_bucket_schemas: Vec<HashBucketSchema>,
        range_schema: RangeSchema,
    ) -> PartitionSchema {
        PartitionSchema {
            hash_bucket_schemas,
            range_schema,
        }
    }

    /// A scheme that range-partitions over the given columns with no hashing.
    pub fn range_over(columns: Vec<usize>) -> PartitionSchema {
        PartitionSchema::new(Vec::new(), RangeSchema::new(columns))
    }

    pub fn hash_bucket_schemas(&self) -> &[HashBucketSchema] {
        &self.hash_bucket_schemas
    }

    pub fn range_schema(&self) -> &RangeSchema {
        &self.range_schema
    }

    /// Every column index referenced by this scheme.
    pub fn referenced_columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.hash_bucket_schemas
            .iter()
            .flat_map(|h| h.columns.iter().copied())
            .chain(self.range_schema.columns.iter().copied())
    }

    /// Computes the partition key routing `row` to its owning tablet. Every
    /// referenced column must be set and non-NULL.
    pub fn encode_partition_key(&self, row: &PartialRow) -> Result<Vec<u8>> {
        let mut key = Vec::new();
        for hash_schema in &self.hash_bucket_schemas {
            key.extend_from_slice(&hash_schema.bucket_for(row)?.to_be_bytes());
        }
        encode_ordered_columns(row, &self.range_schema.columns, &mut key)?;
        Ok(key)
    }
}

/// A tablet's partition-key range, `[lower_bound, upper_bound)`. An empty
/// lower bound is unbounded below; an empty upper bound is unbounded above.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub lower_bound: Vec<u8>,
    pub upper_bound: Vec<u8>,
}

impl Partition {
    pub fn new(lower_bound: Vec<u8>, upper_bound: Vec<u8>) -> Partition {
        Partition {
            lower_bound,
            upper_bound,
        }
    }

    /// The partition covering the whole key space.
    pub fn unbounded() -> Partition {
        Partition::default()
    }

    /// Whether `partition_key` falls inside this partition.
    pub fn covers(&self, partition_key: &[u8]) -> bool {
        partition_key >= self.lower_bound.as_slice()
            && (self.upper_bound.is_empty() || partition_key < self.upper_bound.as_slice())
    }
}

/// Appends the order-preserving encoding of the given columns to `out`.
///
/// Integers are encoded big-endian with the sign bit flipped. Variable-length
/// columns are emitted raw in the final position; elsewhere `0x00` bytes are
/// escaped to `0x00 0x01` and the value is terminated with `0x00 0x00`, so
/// composite keys compare correctly byte-wise.
pub fn encode_ordered_columns(
    row: &PartialRow,
    columns: &[usize],
    out: &mut Vec<u8>,
) -> Result<()> {
    for (pos, &idx) in columns.iter().enumerate() {
        let column = row.schema().column(idx)?;
        if !row.is_set(idx) || row.is_null(idx) {
            invalid_argument!(
                "partition column {} is not set to a non-NULL value",
                column.name()
            );
        }
        let last = pos == columns.len() - 1;
        match column.data_type() {
            DataType::Int8 => {
                out.push(row.fixed_cell(idx)[0] ^ 0x80);
            }
            DataType::Int16 => {
                let v = u16::from_le_bytes(row.fixed_cell(idx).try_into().unwrap());
                out.extend_from_slice(&(v ^ 0x8000).to_be_bytes());
            }
            DataType::Int32 => {
                let v = u32::from_le_bytes(row.fixed_cell(idx).try_into().unwrap());
                out.extend_from_slice(&(v ^ 0x8000_0000).to_be_bytes());
            }
            DataType::Int64 | DataType::UnixtimeMicros => {
                let v = u64::from_le_bytes(row.fixed_cell(idx).try_into().unwrap());
                out.extend_from_slice(&(v ^ 0x8000_0000_0000_0000).to_be_bytes());
            }
            DataType::String | DataType::Binary => {
                let cell = row.var_len_cell(idx);
                if last {
                    out.extend_from_slice(cell);
                } else {
                    for &byte in cell.iter() {
                        out.push(byte);
                        if byte == 0 {
                            out.push(1);
                        }
                    }
                    out.extend_from_slice(&[0, 0]);
                }
            }
            other => invalid_argument!(
                "column {} of type {other} cannot appear in a partition key",
                column.name()
            ),
        }
    }
    Ok(())
}

/// MurmurHash2, 64-bit variant. Part of the wire contract with the server:
/// hash-bucket assignment must be identical on every client.
fn murmur2_64(data: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut h = seed ^ (data.len() as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, &byte) in tail.iter().enumerate() {
            h ^= (byte as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}
