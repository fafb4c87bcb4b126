//! Persistence for tournament results.

pub mod result_store;

pub use result_store::{
    read_records, AppendOutcome, JsonlResultStore, MemoryResultStore, ResultStore,
};
