//! Partially-specified rows.
//!
//! A [`PartialRow`] tracks, per column, whether a value has been explicitly
//! assigned and whether that value is NULL. Fixed-width cells live in a
//! contiguous row area at schema-defined offsets; variable-length cells are
//! kept out of line and only flattened into indirect data by the wire
//! encoder.

use std::sync::Arc;

use bytes::Bytes;
use lamina_errors::{illegal_state, invalid_argument, Result};

use crate::bitset;
use crate::schema::Schema;
use crate::types::DataType;

/// A row with a subset of its columns assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRow {
    schema: Arc<Schema>,
    fixed: Vec<u8>,
    isset: Vec<u8>,
    isnull: Vec<u8>,
    varlen: Vec<Option<Bytes>>,
    frozen: bool,
}

impl PartialRow {
    /// Creates an empty row for the given schema.
    pub fn new(schema: Arc<Schema>) -> PartialRow {
        let num_columns = schema.num_columns();
        let bitset_len = schema.bitset_len();
        PartialRow {
            fixed: vec![0; schema.row_size()],
            isset: vec![0; bitset_len],
            isnull: vec![0; bitset_len],
            varlen: vec![None; num_columns],
            frozen: false,
            schema,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Whether the column at `idx` has been assigned (possibly to NULL).
    pub fn is_set(&self, idx: usize) -> bool {
        bitset::get(&self.isset, idx)
    }

    /// Whether the column at `idx` has been assigned NULL.
    pub fn is_null(&self, idx: usize) -> bool {
        bitset::get(&self.isnull, idx)
    }

    /// Whether every primary-key column is assigned and non-NULL.
    pub fn primary_key_is_set(&self) -> bool {
        (0..self.schema.num_key_columns()).all(|idx| self.is_set(idx) && !self.is_null(idx))
    }

    /// Marks the row read-only. Every subsequent setter fails with
    /// [`lamina_errors::Error::IllegalState`]. Idempotent.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Clears the frozen bit. Used by the session when admission fails, so a
    /// rejected row is handed back to the caller unmodified and mutable.
    pub fn thaw(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Assigns a value to the column at `idx`. The value's Rust type must
    /// match the column type.
    pub fn set<V: Cell>(&mut self, idx: usize, value: V) -> Result<()> {
        self.check_mutable()?;
        let column = self.schema.column(idx)?;
        if !V::accepts(column.data_type()) {
            invalid_argument!(
                "wrong type for column {} ({})",
                column.name(),
                column.data_type()
            );
        }
        value.store(self, idx);
        bitset::set(&mut self.isset, idx);
        bitset::clear(&mut self.isnull, idx);
        Ok(())
    }

    /// Assigns a value to the named column.
    pub fn set_by_name<V: Cell>(&mut self, name: &str, value: V) -> Result<()> {
        let idx = self.column_index(name)?;
        self.set(idx, value)
    }

    /// Assigns NULL to the column at `idx`, which must be nullable.
    pub fn set_null(&mut self, idx: usize) -> Result<()> {
        self.check_mutable()?;
        let column = self.schema.column(idx)?;
        if !column.is_nullable() {
            invalid_argument!("column {} is not nullable", column.name());
        }
        self.varlen[idx] = None;
        bitset::set(&mut self.isset, idx);
        bitset::set(&mut self.isnull, idx);
        Ok(())
    }

    /// Assigns NULL to the named column.
    pub fn set_null_by_name(&mut self, name: &str) -> Result<()> {
        let idx = self.column_index(name)?;
        self.set_null(idx)
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        match self.schema.column_index(name) {
            Some(idx) => Ok(idx),
            None => invalid_argument!("unknown column {name}"),
        }
    }

    fn check_mutable(&self) -> Result<()> {
        if self.frozen {
            illegal_state!("row has been submitted and cannot be modified");
        }
        Ok(())
    }

    /// The fixed-width slot of a fixed-size column, little-endian.
    pub(crate) fn fixed_cell(&self, idx: usize) -> &[u8] {
        let offset = self.schema.column_offset(idx);
        let size = self.schema.columns()[idx].data_type().fixed_size();
        &self.fixed[offset..offset + size]
    }

    /// The out-of-line payload of a set, non-NULL variable-length column.
    pub(crate) fn var_len_cell(&self, idx: usize) -> &Bytes {
        self.varlen[idx]
            .as_ref()
            .expect("var-len cell read for a column that was never assigned")
    }

    fn write_fixed(&mut self, idx: usize, bytes: &[u8]) {
        let offset = self.schema.column_offset(idx);
        self.fixed[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Codec entry point: stores a fixed-width cell read off the wire.
    pub(crate) fn set_raw_fixed(&mut self, idx: usize, bytes: &[u8]) {
        self.write_fixed(idx, bytes);
        bitset::set(&mut self.isset, idx);
        bitset::clear(&mut self.isnull, idx);
    }

    /// Codec entry point: stores a variable-length cell read off the wire.
    pub(crate) fn set_raw_var_len(&mut self, idx: usize, cell: Bytes) {
        self.varlen[idx] = Some(cell);
        bitset::set(&mut self.isset, idx);
        bitset::clear(&mut self.isnull, idx);
    }
}

/// A Rust value that can be stored into a [`PartialRow`] cell.
///
/// Sealed; implemented for the primitive types matching each [`DataType`],
/// for string types (STRING columns), and for byte types (BINARY columns).
pub trait Cell: sealed::Sealed {
    #[doc(hidden)]
    fn accepts(data_type: DataType) -> bool;
    #[doc(hidden)]
    fn store(self, row: &mut PartialRow, idx: usize);
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! fixed_cell {
    ($ty:ty, $pattern:pat) => {
        impl sealed::Sealed for $ty {}
        impl Cell for $ty {
            fn accepts(data_type: DataType) -> bool {
                matches!(data_type, $pattern)
            }
            fn store(self, row: &mut PartialRow, idx: usize) {
                row.write_fixed(idx, &self.to_le_bytes());
            }
        }
    };
}

fixed_cell!(i8, DataType::Int8);
fixed_cell!(i16, DataType::Int16);
fixed_cell!(i32, DataType::Int32);
fixed_cell!(i64, DataType::Int64 | DataType::UnixtimeMicros);
fixed_cell!(f32, DataType::Float);
fixed_cell!(f64, DataType::Double);

impl sealed::Sealed for bool {}
impl Cell for bool {
    fn accepts(data_type: DataType) -> bool {
        data_type == DataType::Bool
    }
    fn store(self, row: &mut PartialRow, idx: usize) {
        row.write_fixed(idx, &[self as u8]);
    }
}

impl sealed::Sealed for &str {}
impl Cell for &str {
    fn accepts(data_type: DataType) -> bool {
        data_type == DataType::String
    }
    fn store(self, row: &mut PartialRow, idx: usize) {
        row.varlen[idx] = Some(Bytes::copy_from_slice(self.as_bytes()));
    }
}

impl sealed::Sealed for String {}
impl Cell for String {
    fn accepts(data_type: DataType) -> bool {
        data_type == DataType::String
    }
    fn store(self, row: &mut PartialRow, idx: usize) {
        row.varlen[idx] = Some(Bytes::from(self.into_bytes()));
    }
}

impl sealed::Sealed for &[u8] {}
impl Cell for &[u8] {
    fn accepts(data_type: DataType) -> bool {
        data_type == DataType::Binary
    }
    fn store(self, row: &mut PartialRow, idx: usize) {
        row.varlen[idx] = Some(Bytes::copy_from_slice(self));
    }
}

impl sealed::Sealed for Bytes {}
impl Cell for Bytes {
    fn accepts(data_type: DataType) -> bool {
        data_type == DataType::Binary
    }
    fn store(self, row: &mut PartialRow, idx: usize) {
        row.varlen[idx] = Some(self);
    }
}
