//! monthly-extract - concurrent monthly metrics extraction.
//!
//! Runs a registry of read-only queries against PostgreSQL with a bounded
//! worker pool and writes each result as its own spreadsheet inside a folder
//! named after the reporting month.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod logging;
pub mod period;
pub mod pipeline;
pub mod preflight;
pub mod registry;
pub mod safety;
pub mod writer;
