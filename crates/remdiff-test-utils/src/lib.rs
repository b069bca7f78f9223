//! Test support for remdiff.
//!
//! Provides an in-process SFTP version 3 server speaking the real wire
//! protocol over a `UnixStream` pair, so client and driver behaviour can
//! be exercised without ssh or a network.

mod mock_server;

pub use mock_server::{MockSftpServer, ServerHandle, ServerStats, HOME};
