//! SeaORM entity models for the repo syncer.

pub mod external_service;
pub mod repo;
pub mod sync_job;
