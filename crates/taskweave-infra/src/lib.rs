//! Infrastructure layer for Taskweave.
//!
//! Contains implementations of the ports defined in `taskweave-core`: an
//! in-memory TTL result cache, plus the TOML configuration loader.

pub mod cache;
pub mod config;
