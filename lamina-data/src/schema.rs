//! Table schemas: an ordered list of columns of which a non-nullable prefix
//! forms the primary key.

use lamina_errors::{invalid_argument, Error, Result};

use crate::bitset;
use crate::types::DataType;

/// A single column: name, type, nullability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    name: String,
    data_type: DataType,
    is_nullable: bool,
}

impl ColumnSchema {
    /// Creates a non-nullable column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            data_type,
            is_nullable: false,
        }
    }

    /// Marks the column as nullable.
    pub fn nullable(mut self) -> ColumnSchema {
        self.is_nullable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.is_nullable
    }
}

/// An immutable table schema.
///
/// Column offsets into the fixed-width row area are precomputed at
/// construction; rows and the wire codec index cells through them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
    column_offsets: Vec<usize>,
    row_size: usize,
    has_nullable: bool,
}

impl Schema {
    /// Builds a schema whose first `num_key_columns` columns form the primary
    /// key. Key columns must be non-nullable and of a keyable type; column
    /// names must be unique.
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Result<Schema> {
        if columns.is_empty() {
            invalid_argument!("a schema requires at least one column");
        }
        if num_key_columns == 0 || num_key_columns > columns.len() {
            invalid_argument!(
                "invalid number of key columns: {num_key_columns} of {}",
                columns.len()
            );
        }
        for (idx, column) in columns.iter().enumerate() {
            if idx < num_key_columns {
                if column.is_nullable {
                    invalid_argument!("key column {} must not be nullable", column.name);
                }
                if !column.data_type.is_keyable() {
                    invalid_argument!(
                        "key column {} has non-keyable type {}",
                        column.name,
                        column.data_type
                    );
                }
            }
            if columns[..idx].iter().any(|c| c.name == column.name) {
                invalid_argument!("duplicate column name {}", column.name);
            }
        }

        let mut column_offsets = Vec::with_capacity(columns.len());
        let mut row_size = 0;
        for column in &columns {
            column_offsets.push(row_size);
            row_size += column.data_type.fixed_size();
        }
        let has_nullable = columns.iter().any(|c| c.is_nullable);

        Ok(Schema {
            columns,
            num_key_columns,
            column_offsets,
            row_size,
            has_nullable,
        })
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    /// Looks up a column by index.
    pub fn column(&self, idx: usize) -> Result<&ColumnSchema> {
        self.columns
            .get(idx)
            .ok_or_else(|| Error::InvalidArgument(format!("column index {idx} out of bounds")))
    }

    /// Looks up a column index by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Byte offset of a column's slot in the fixed-width row area.
    pub fn column_offset(&self, idx: usize) -> usize {
        self.column_offsets[idx]
    }

    /// Total width of the fixed-width row area.
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    /// Width in bytes of a per-row column bitset.
    pub fn bitset_len(&self) -> usize {
        bitset::len_bytes(self.columns.len())
    }

    pub fn has_nullable_columns(&self) -> bool {
        self.has_nullable
    }
}

/// Builder for [`Schema`], in the usual add-columns-then-name-the-key style.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    columns: Vec<ColumnSchema>,
    key_columns: Vec<String>,
}

impl SchemaBuilder {
    pub fn new() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn add_column(mut self, column: ColumnSchema) -> SchemaBuilder {
        self.columns.push(column);
        self
    }

    /// Names the primary-key columns. They must form a prefix of the added
    /// columns, in order.
    pub fn primary_key<S: Into<String>, I: IntoIterator<Item = S>>(
        mut self,
        names: I,
    ) -> SchemaBuilder {
        self.key_columns = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<Schema> {
        if self.key_columns.is_empty() {
            invalid_argument!("a schema requires at least one key column");
        }
        for (idx, name) in self.key_columns.iter().enumerate() {
            match self.columns.get(idx) {
                Some(column) if column.name() == name => {}
                _ => invalid_argument!(
                    "primary key columns must form a prefix of the schema; {name} is out of place"
                ),
            }
        }
        Schema::new(self.columns, self.key_columns.len())
    }
}
