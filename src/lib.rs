pub mod background_jobs;
pub mod config;
pub mod metrics;
pub mod sqlite_persistence;
