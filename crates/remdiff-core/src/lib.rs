//! remdiff-core: SFTP transport and shared plumbing for remdiff.
//!
//! This crate provides:
//! - An SFTP version 3 client multiplexing concurrent requests over a
//!   single `ssh` subprocess (`sftp` module)
//! - The shared error model
//! - Descriptor-level I/O helpers used by the transport and the
//!   comparison driver
//! - Logging setup

pub mod error;
pub mod fdio;
pub mod logging;
pub mod sftp;

pub use error::{Error, Result};
