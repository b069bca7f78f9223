//! SFTP version 3 client.
//!
//! This module implements the subset of the SSH File Transfer Protocol
//! needed to read remote files:
//! - Packet framing and field codecs (`codec`)
//! - Wire constants (`consts`)
//! - File attribute decoding (`attrs`)
//! - A connection that multiplexes concurrent requests over one
//!   `ssh -s HOST sftp` subprocess (`connection`)
//! - A process-wide host-to-connection registry (`registry`)
//!
//! The transport is the byte stream `ssh` proxies to the remote sftp
//! subsystem; authentication and session setup are ssh's business.

pub mod attrs;
pub mod codec;
pub mod connection;
pub mod consts;
pub mod registry;

pub use attrs::Attributes;
pub use connection::Connection;

#[cfg(test)]
mod proptest;
