//! The binary row-operations codec.
//!
//! A set of operations sharing one schema is packed into two contiguous
//! blobs: `rows`, the concatenation of per-row records, and `indirect_data`,
//! the concatenation of variable-length cell payloads. A per-row record is:
//!
//! ```text
//! [change type]  one byte
//! [isset bitset] one bit per column, LSB-first
//! [null bitset]  same layout, present only if the schema has nullable columns
//! [cells]        for each set, non-NULL column in schema order: either the
//!                fixed-width little-endian payload, or a little-endian
//!                (u64 offset, u64 length) pointer into indirect_data
//! ```
//!
//! Rows are concatenated end to end with no padding. The same codec
//! serializes range-partition bound descriptors as pseudo-rows with their own
//! change types.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use lamina_errors::{invalid_argument, Error, Result};

use crate::bitset;
use crate::row::PartialRow;
use crate::schema::Schema;

/// The change type of an encoded row.
///
/// `Insert` through `Upsert` are row mutations; the remaining variants are
/// encoder-only descriptors used in table-creation payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowOperationType {
    Insert,
    Update,
    Delete,
    Upsert,
    SplitRow,
    RangeLowerBound,
    RangeUpperBound,
    ExclusiveRangeLowerBound,
    InclusiveRangeUpperBound,
}

impl RowOperationType {
    /// The single-byte wire value.
    pub fn to_wire(self) -> u8 {
        match self {
            RowOperationType::Insert => 1,
            RowOperationType::Update => 2,
            RowOperationType::Delete => 3,
            RowOperationType::SplitRow => 4,
            RowOperationType::Upsert => 5,
            RowOperationType::RangeLowerBound => 6,
            RowOperationType::RangeUpperBound => 7,
            RowOperationType::ExclusiveRangeLowerBound => 8,
            RowOperationType::InclusiveRangeUpperBound => 9,
        }
    }

    pub fn from_wire(value: u8) -> Option<RowOperationType> {
        match value {
            1 => Some(RowOperationType::Insert),
            2 => Some(RowOperationType::Update),
            3 => Some(RowOperationType::Delete),
            4 => Some(RowOperationType::SplitRow),
            5 => Some(RowOperationType::Upsert),
            6 => Some(RowOperationType::RangeLowerBound),
            7 => Some(RowOperationType::RangeUpperBound),
            8 => Some(RowOperationType::ExclusiveRangeLowerBound),
            9 => Some(RowOperationType::InclusiveRangeUpperBound),
            _ => None,
        }
    }

    /// True for the row-mutation types, which require a fully-set primary
    /// key. The range-descriptor types may leave key columns unset.
    pub fn is_row_change(self) -> bool {
        matches!(
            self,
            RowOperationType::Insert
                | RowOperationType::Update
                | RowOperationType::Delete
                | RowOperationType::Upsert
        )
    }
}

/// One change type paired with its row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOperation {
    pub op_type: RowOperationType,
    pub row: PartialRow,
}

impl RowOperation {
    pub fn new(op_type: RowOperationType, row: PartialRow) -> RowOperation {
        RowOperation { op_type, row }
    }
}

/// The encoded payload: row records plus out-of-line cell data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowOperations {
    pub rows: Bytes,
    pub indirect_data: Bytes,
}

/// Encodes operations sharing one schema, in input order. Returns `None` for
/// an empty input. The first operation's schema is authoritative; a mismatch
/// or an incomplete primary key on a row-change operation is a programmer
/// error.
pub fn encode_row_operations<'a, I>(ops: I) -> Result<Option<RowOperations>>
where
    I: IntoIterator<Item = &'a RowOperation>,
{
    let ops: Vec<&RowOperation> = ops.into_iter().collect();
    let Some(first) = ops.first() else {
        return Ok(None);
    };
    let schema = first.row.schema().clone();
    let bitset_len = schema.bitset_len();
    let record_size =
        1 + schema.row_size() + bitset_len + if schema.has_nullable_columns() { bitset_len } else { 0 };

    let mut rows = BytesMut::with_capacity(ops.len() * record_size);
    let mut indirect = BytesMut::new();

    for op in &ops {
        if **op.row.schema() != *schema {
            invalid_argument!("row operations must all share the first operation's schema");
        }
        if op.op_type.is_row_change() && !op.row.primary_key_is_set() {
            invalid_argument!("primary key columns must be set and non-NULL");
        }

        rows.put_u8(op.op_type.to_wire());
        let mut isset = vec![0u8; bitset_len];
        let mut isnull = vec![0u8; bitset_len];
        for idx in 0..schema.num_columns() {
            if op.row.is_set(idx) {
                bitset::set(&mut isset, idx);
            }
            if op.row.is_null(idx) {
                bitset::set(&mut isnull, idx);
            }
        }
        rows.put_slice(&isset);
        if schema.has_nullable_columns() {
            rows.put_slice(&isnull);
        }

        for (idx, column) in schema.columns().iter().enumerate() {
            if !op.row.is_set(idx) || op.row.is_null(idx) {
                continue;
            }
            if column.data_type().is_var_len() {
                let cell = op.row.var_len_cell(idx);
                rows.put_u64_le(indirect.len() as u64);
                rows.put_u64_le(cell.len() as u64);
                indirect.put_slice(cell);
            } else {
                rows.put_slice(op.row.fixed_cell(idx));
            }
        }
    }

    Ok(Some(RowOperations {
        rows: rows.freeze(),
        indirect_data: indirect.freeze(),
    }))
}

/// Decodes an encoded payload back into operations against `schema`.
///
/// Used by response handling and by tests and in-process servers; all reads
/// are bounds-checked and malformed input surfaces as
/// [`Error::Serialization`].
pub fn decode_row_operations(
    schema: &Arc<Schema>,
    encoded: &RowOperations,
) -> Result<Vec<RowOperation>> {
    let mut cursor = Cursor {
        buf: &encoded.rows,
        pos: 0,
    };
    let bitset_len = schema.bitset_len();
    let mut ops = Vec::new();

    while !cursor.is_empty() {
        let op_type = cursor.take(1)?[0];
        let op_type = RowOperationType::from_wire(op_type)
            .ok_or_else(|| Error::Serialization(format!("unknown change type {op_type}")))?;
        let isset = cursor.take(bitset_len)?.to_vec();
        let isnull = if schema.has_nullable_columns() {
            cursor.take(bitset_len)?.to_vec()
        } else {
            vec![0; bitset_len]
        };

        let mut row = PartialRow::new(schema.clone());
        for (idx, column) in schema.columns().iter().enumerate() {
            if !bitset::get(&isset, idx) {
                continue;
            }
            if bitset::get(&isnull, idx) {
                row.set_null(idx).map_err(|_| {
                    Error::Serialization(format!(
                        "null bit set for non-nullable column {}",
                        column.name()
                    ))
                })?;
                continue;
            }
            if column.data_type().is_var_len() {
                let pointer = cursor.take(16)?;
                let offset = u64::from_le_bytes(pointer[..8].try_into().unwrap()) as usize;
                let length = u64::from_le_bytes(pointer[8..].try_into().unwrap()) as usize;
                let end = offset.checked_add(length).filter(|&e| e <= encoded.indirect_data.len());
                let Some(end) = end else {
                    return Err(Error::Serialization(format!(
                        "indirect cell ({offset}, {length}) is out of bounds"
                    )));
                };
                row.set_raw_var_len(idx, encoded.indirect_data.slice(offset..end));
            } else {
                let cell = cursor.take(column.data_type().fixed_size())?;
                row.set_raw_fixed(idx, cell);
            }
        }
        ops.push(RowOperation { op_type, row });
    }

    Ok(ops)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(Error::Serialization(
                "row operations payload is truncated".into(),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}
