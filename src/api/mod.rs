//! Public API entry points
//!
//! The SQLite C interface expressed as Rust free functions over a
//! connection and its prepared statements.

pub mod config;
mod connection;
mod stmt;

pub use config::{DbConfig, DbConfigOption, Optimizations};
pub use connection::*;
pub use stmt::*;
