//! wd-core: approval pipeline for sandboxed scripts.
//!
//! Captures a script's side effects in a dry run, classifies them against a
//! profile, holds them for approval, commits them with a checkpoint, and
//! rolls them back on request. Exposed as a library for integration testing.

pub mod allowlist;
pub mod audit;
pub mod blob;
pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod policy;
pub mod predict;
pub mod rollback;
pub mod runner;
pub mod session;
pub mod store;

pub use engine::{Engine, RunOptions};
pub use error::{CoreError, Result};
