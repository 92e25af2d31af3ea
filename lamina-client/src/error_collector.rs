//! Bounded collection of row errors surfaced by background flushes.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::warn;

use crate::operation::RowError;

/// A bounded FIFO of [`RowError`]s. When full, the oldest error is dropped
/// and the overflow flag is raised until the next drain.
#[derive(Debug)]
pub struct ErrorCollector {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    errors: VecDeque<RowError>,
    max_capacity: usize,
    overflowed: bool,
}

impl ErrorCollector {
    pub fn new(max_capacity: usize) -> ErrorCollector {
        assert!(max_capacity > 0, "error collector requires a capacity");
        ErrorCollector {
            state: Mutex::new(State {
                errors: VecDeque::with_capacity(max_capacity),
                max_capacity,
                overflowed: false,
            }),
        }
    }

    pub fn add(&self, error: RowError) {
        let mut state = self.state.lock();
        if state.errors.len() >= state.max_capacity {
            warn!("error collector is full, dropping the oldest row error");
            state.errors.pop_front();
            state.overflowed = true;
        }
        state.errors.push_back(error);
    }

    pub fn count(&self) -> usize {
        self.state.lock().errors.len()
    }

    /// Drains all collected errors and clears the overflow flag. The returned
    /// flag reports whether any error was dropped since the last drain.
    pub fn take_all(&self) -> (Vec<RowError>, bool) {
        let mut state = self.state.lock();
        let overflowed = state.overflowed;
        state.overflowed = false;
        (state.errors.drain(..).collect(), overflowed)
    }

    /// Re-sizes the collector, discarding anything collected so far. Invoked
    /// when the session's mutation buffer space is re-configured.
    pub(crate) fn reset_capacity(&self, max_capacity: usize) {
        assert!(max_capacity > 0, "error collector requires a capacity");
        let mut state = self.state.lock();
        state.errors = VecDeque::with_capacity(max_capacity);
        state.max_capacity = max_capacity;
        state.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lamina_data::schema::{ColumnSchema, SchemaBuilder};
    use lamina_data::types::DataType;
    use lamina_data::PartitionSchema;
    use lamina_errors::Error;

    use super::*;
    use crate::operation::Operation;
    use crate::table::Table;

    fn test_table() -> Arc<Table> {
        let schema = Arc::new(
            SchemaBuilder::new()
                .add_column(ColumnSchema::new("key", DataType::Int32))
                .primary_key(["key"])
                .build()
                .unwrap(),
        );
        Arc::new(Table::new("tid", "t", schema, PartitionSchema::range_over(vec![0])).unwrap())
    }

    fn row_error(key: i32) -> RowError {
        let mut op = Operation::insert(&test_table());
        op.row_mut().set(0, key).unwrap();
        RowError::new(Error::AlreadyPresent("key already present".into()), op, None)
    }

    #[test]
    fn drains_in_insertion_order() {
        let collector = ErrorCollector::new(4);
        for key in 0..3 {
            collector.add(row_error(key));
        }
        assert_eq!(collector.count(), 3);
        let (errors, overflowed) = collector.take_all();
        assert!(!overflowed);
        assert_eq!(errors.len(), 3);
        let mut first = Operation::insert(&test_table());
        first.row_mut().set(0, 0i32).unwrap();
        assert_eq!(errors[0].operation().row(), first.row());
        assert_eq!(collector.count(), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_flags() {
        let collector = ErrorCollector::new(2);
        for key in 0..3 {
            collector.add(row_error(key));
        }
        assert_eq!(collector.count(), 2);
        let (errors, overflowed) = collector.take_all();
        assert!(overflowed);
        assert_eq!(errors.len(), 2);

        // The flag clears on drain.
        collector.add(row_error(9));
        let (_, overflowed) = collector.take_all();
        assert!(!overflowed);
    }

    #[test]
    fn reset_capacity_discards_state() {
        let collector = ErrorCollector::new(1);
        collector.add(row_error(0));
        collector.add(row_error(1));
        collector.reset_capacity(8);
        assert_eq!(collector.count(), 0);
        let (_, overflowed) = collector.take_all();
        assert!(!overflowed);
    }
}
