//! Change data capture core for replicated binlog streams.
//!
//! A [`canal::Canal`] pulls decoded row events from a
//! [`upstream::BinlogSource`] in log order, hands every event to the
//! [`consumer::RowsEventHandler`]s registered for its table and keeps a
//! durable cursor into the log in a [`checkpoints::PositionStore`].
pub mod canal;
pub mod cdc_types;
pub mod checkpoints;
pub mod config;
pub mod consumer;
pub mod dispatcher;
mod e2e_tests;
pub mod error;
pub mod registry;
pub mod rotation;
pub mod upstream;

// Test helpers are public only with the `test` feature,
// so that dependent crates can drive a canal in their own tests.
#[cfg(all(test, not(feature = "test")))]
mod test_utilities;

#[cfg(feature = "test")]
pub mod test_utilities;
