//! Client write sessions for the Lamina columnar table store.
//!
//! The entry point is [`Session`]: it accepts individual row mutations,
//! groups them by destination tablet, and dispatches them as batched write
//! RPCs through a pluggable [`WriteTransport`], resolving tablet ownership
//! through a pluggable [`TabletRouter`]. Buffering is double-buffered with
//! bounded capacity; backpressure surfaces as
//! [`ApplyError::Throttled`](session::ApplyError) carrying a notification
//! the producer can await.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example(
//! #     transport: Arc<dyn lamina_client::WriteTransport>,
//! #     router: Arc<dyn lamina_client::TabletRouter>,
//! #     table: Arc<lamina_client::Table>,
//! # ) -> lamina_errors::Result<()> {
//! use lamina_client::{FlushMode, Session};
//!
//! let mut session = Session::new(transport, router);
//! session.set_flush_mode(FlushMode::ManualFlush)?;
//! let mut insert = lamina_client::Operation::insert(&table);
//! insert.row_mut().set_by_name("key", 42i32)?;
//! insert.row_mut().set_by_name("val", "hello")?;
//! let pending = session.apply(insert).expect("session has capacity");
//! session.flush().await;
//! let response = pending.await?;
//! assert!(!response.has_row_error());
//! # Ok(())
//! # }
//! ```

mod batch;
pub mod buffer;
pub mod config;
pub mod error_collector;
pub mod operation;
pub mod router;
pub mod session;
pub mod table;
pub mod transport;

pub use buffer::FlushNotification;
pub use config::{ExternalConsistencyMode, FlushMode};
pub use error_collector::ErrorCollector;
pub use operation::{Operation, OperationResponse, PendingOperation, RowError};
pub use router::{LocateError, LocatedTablet, TabletRouter};
pub use session::{ApplyError, Session};
pub use table::Table;
pub use transport::{PerRowError, Sidecars, WriteRequest, WriteResponse, WriteTransport};
