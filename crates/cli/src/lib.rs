//! tidyrun CLI
//!
//! Command-line interface for running end-to-end definitions and managing
//! cleanups that were left unfinished.

pub mod commands;
pub mod output;

/// All tests passed and cleanup left nothing behind
pub const EXIT_OK: i32 = 0;
/// At least one test failed
pub const EXIT_TESTS_FAILED: i32 = 1;
/// Tests passed but cleanup failed
pub const EXIT_CLEANUP_FAILED: i32 = 2;
/// Invalid definitions, dependency cycles or a server that never came up
pub const EXIT_FATAL: i32 = 3;
/// Interrupted by the user
pub const EXIT_INTERRUPTED: i32 = 130;
