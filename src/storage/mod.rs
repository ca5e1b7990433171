//! SQLite storage layer for the records store.
//!
//! This module provides the persistence layer using SQLite with:
//! - WAL mode for concurrent readers beside the sync worker
//! - One IMMEDIATE transaction per record apply
//! - Audit events committed with every row change
//!
//! # Submodules
//!
//! - [`events`] - Audit event storage
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main SQLite storage implementation

pub mod events;
pub mod migrations;
pub mod schema;
pub mod sqlite;

pub use sqlite::{CursorRecord, MutationContext, PendingAttempt, SqliteStorage};
