//! # Repo Syncer Library
//!
//! This library provides the core functionality for the repo syncer service:
//! reconciliation of the repository inventory against external sources, the
//! scheduling and execution of sync jobs, and the backing store.

pub mod backoff;
pub mod config;
pub mod db;
pub mod diff;
pub mod logging;
pub mod models;
pub mod scheduler;
pub mod single_flight;
pub mod sources;
pub mod store;
pub mod syncer;
pub mod worker;
pub use migration;
