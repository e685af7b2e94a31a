//! CLI Commands

pub mod cleanup;
pub mod run;
