pub mod handlers;
#[cfg(test)]
pub mod memory;
pub mod store;

pub use store::{JobStore, NewJob, PgJobStore, StatusUpdate, StoreError};
