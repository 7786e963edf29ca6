pub mod config;
pub mod error;
pub mod leases;
pub mod producer;
pub mod queue;
pub mod reaper;
pub mod redis;
pub mod staging;
pub mod store;
pub mod text;
pub mod types;

pub use error::{StoreError, StoreResult};
