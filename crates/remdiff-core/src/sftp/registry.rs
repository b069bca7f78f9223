//! Process-wide shared SFTP connections.
//!
//! Connections are keyed by hostname, created lazily, and never removed:
//! each entry owns a live ssh subprocess that is torn down when the
//! process exits and the child sees EOF on its pipes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::Result;
use crate::sftp::connection::Connection;

static CONNECTIONS: OnceLock<Mutex<HashMap<String, Arc<Connection>>>> = OnceLock::new();

/// Get the shared connection for `host`, connecting it on first use.
///
/// Connecting happens outside the registry lock; the connection's own
/// locking keeps concurrent attempts idempotent.
pub fn connection(host: &str) -> Result<Arc<Connection>> {
    let registry = CONNECTIONS.get_or_init(|| Mutex::new(HashMap::new()));
    let conn = {
        let mut map = registry.lock().unwrap();
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Connection::new(host)))
            .clone()
    };
    conn.connect()?;
    Ok(conn)
}
