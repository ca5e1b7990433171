//! trs-sync - teacher records synchronization engine
//!
//! Keeps the records store consistent with a source-of-truth system that
//! is only reachable through an at-least-once, unordered change feed.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`model`] - Data types (entity types, source snapshots, target rows)
//! - [`storage`] - SQLite database layer
//! - [`sync`] - Decoder, mapper, orchestrator and batch runner
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod storage;
pub mod sync;

pub use error::{Error, Result};
