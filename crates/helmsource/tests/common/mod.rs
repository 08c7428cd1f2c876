//! Shared utilities for helmsource integration tests.

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{eventually, TestHarness};
