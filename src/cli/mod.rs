//! CLI command implementations.

pub mod boot;
