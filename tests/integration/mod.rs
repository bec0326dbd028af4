//! Integration tests for monthly-extract.

pub mod pipeline_test;
pub mod postgres_test;
pub mod registry_test;
