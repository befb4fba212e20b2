// Core modules implementing splitting, execution, spooled storage, and export.
pub mod batch;
pub mod codec;
pub mod column;
pub mod connection;
pub mod error;
pub mod events;
pub mod export;
pub mod query;
pub mod result_set;
pub mod selection;
pub mod service;
pub mod splitter;
pub mod spool;
pub mod subset;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;
