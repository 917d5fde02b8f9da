//! Core abstractions shared by the pipeline engine and all adapters.
//!
//! - [`schema`]: database-agnostic table and column metadata
//! - [`value`]: row values crossing heterogeneous stores
//! - [`traits`]: the source/destination adapter capability sets

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{ColumnDef, ForeignKey, IndexDef, MappedColumn, TableDescriptor, UniqueConstraint};
pub use traits::{BatchStream, DestinationAdapter, SourceAdapter};
pub use value::{Batch, Record, Value};
