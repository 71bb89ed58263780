//! Row and index storage for user tables.

pub mod codec;
pub mod writer;

pub use codec::StoredRow;
pub use writer::TableWriter;
