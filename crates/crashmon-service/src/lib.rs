//! Crash report ingestion and deduplication.
//!
//! The service polls a crash server for new reports, analyzes their backtraces into stable
//! crash signatures and keeps one issue tracker ticket per signature up to date.

#[macro_use]
pub mod metrics;

pub mod analyzer;
pub mod config;
pub mod crash_server;
pub mod dump_tool;
pub mod fetch;
pub mod jira;
pub mod monitor;
pub mod report;
pub mod restore;
pub mod store;
pub mod tracker;
pub mod upload;
pub mod utils;
