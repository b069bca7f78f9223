//! remdiff: compare files that may live on remote hosts, over SSH.
//!
//! The binary lives in `main.rs`; this library surface exists so
//! integration tests can exercise argument parsing and the comparison
//! driver directly.

pub mod cli;
pub mod compare;
