//! SFTP connection over an `ssh` subprocess.
//!
//! One `Connection` owns one `ssh -s HOST sftp` child and multiplexes
//! concurrent requests over its stdin/stdout pipes. A dedicated reader
//! thread demultiplexes inbound replies into a shared table keyed by
//! request ID; callers rendezvous on a condition variable. Reads and
//! directory reads are split into begin/finish pairs so a streaming
//! consumer can keep several requests in flight across the round trip.

use std::collections::{HashMap, HashSet};
use std::io::{BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use bytes::{Buf, Bytes};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sftp::attrs::Attributes;
use crate::sftp::codec::{PacketBuilder, PacketReader};
use crate::sftp::consts::*;

/// Capacity of the inbound buffered reader.
const INPUT_BUF: usize = 4096;

/// A reply received but not yet consumed. The request ID has already been
/// stripped from `body`.
struct Reply {
    packet_type: u8,
    body: Bytes,
}

/// State guarded by the connection lock.
struct Inner {
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    /// Remote home directory, learned during connect.
    home: String,
    /// Allocation cursor; IDs currently in use are skipped.
    next_id: u32,
    /// IDs submitted but not yet replied to.
    waiting: HashSet<u32>,
    /// Replies received but not yet consumed.
    replies: HashMap<u32, Reply>,
    /// Tells the reader thread to exit.
    quit: bool,
    /// Set when the reader thread died on an error; awaiters see
    /// `ConnectionLost`.
    failed: bool,
}

/// Connection to one remote host's SFTP server.
///
/// Constructed disconnected; `connect` is idempotent and establishes the
/// subprocess, handshake, reader thread and remote home directory.
/// Dropping the connection disconnects it.
pub struct Connection {
    host: String,
    /// Serializes connect/disconnect attempts. Always taken before `inner`.
    connect_lock: Mutex<()>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Connection {
    /// Construct a disconnected connection to `host`.
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            connect_lock: Mutex::new(()),
            inner: Mutex::new(Inner {
                writer: None,
                child: None,
                reader: None,
                home: String::new(),
                next_id: 0,
                waiting: HashSet::new(),
                replies: HashMap::new(),
                quit: false,
                failed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Hostname this connection talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote home directory (empty until connected).
    pub fn home(&self) -> String {
        self.inner.lock().unwrap().home.clone()
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().unwrap().writer.is_some()
    }

    /// Establish the connection: spawn `ssh -s HOST sftp`, perform the
    /// version handshake, start the reader thread and resolve the remote
    /// home directory. Does nothing when already connected.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().unwrap();
        if self.connected() {
            return Ok(());
        }
        debug!(host = %self.host, "connecting");
        let mut child = Command::new("ssh")
            .arg("-s")
            .arg(&self.host)
            .arg("sftp")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(format!("{}: spawn ssh", self.host), e))?;
        let stdin = child.stdin.take().expect("child stdin is piped");
        let stdout = child.stdout.take().expect("child stdout is piped");
        self.establish(Box::new(stdin), Box::new(stdout), Some(child))
    }

    /// Establish over an existing byte stream instead of an `ssh` child.
    ///
    /// The transport seam: anything that proxies bytes to an SFTP server
    /// will do, which is how the in-process test server plugs in.
    pub fn connect_with_transport(
        self: &Arc<Self>,
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Result<()> {
        let _guard = self.connect_lock.lock().unwrap();
        if self.connected() {
            return Ok(());
        }
        self.establish(Box::new(writer), Box::new(reader), None)
    }

    fn establish(
        self: &Arc<Self>,
        writer: Box<dyn Write + Send>,
        reader: Box<dyn Read + Send>,
        child: Option<Child>,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.quit = false;
            inner.failed = false;
            inner.waiting.clear();
            inner.replies.clear();
            inner.home.clear();
            inner.writer = Some(writer);
            inner.child = child;
        }
        match self.handshake(BufReader::with_capacity(INPUT_BUF, reader)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    /// INIT/VERSION exchange, then reader startup and home resolution.
    fn handshake(self: &Arc<Self>, mut input: BufReader<Box<dyn Read + Send>>) -> Result<()> {
        let mut init = PacketBuilder::new(FXP_INIT);
        init.put_u32(SFTP_VERSION);
        self.send(init.finish())?;

        // The VERSION reply carries no request ID, so it is read here
        // before the reader thread takes ownership of the stream.
        let (packet_type, body) = read_packet(&mut input, &self.host)?;
        if packet_type != FXP_VERSION {
            return Err(Error::protocol(format!(
                "{}: unexpected reply to INIT (type {})",
                self.host, packet_type
            )));
        }
        let mut r = PacketReader::new(&body);
        let version = r.get_u32()?;
        if version < SFTP_VERSION {
            return Err(Error::protocol(format!(
                "{}: unsupported SFTP version {}",
                self.host, version
            )));
        }
        // Versions above 3 are driven with version-3 semantics; any
        // advertised extensions in the rest of the body are ignored.
        debug!(host = %self.host, version, "handshake complete");

        let conn = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("sftp-reader-{}", self.host))
            .spawn(move || reader_loop(&conn, input))
            .map_err(|e| Error::io(format!("{}: spawn reader", self.host), e))?;
        self.inner.lock().unwrap().reader = Some(handle);

        let home = self.realpath("")?;
        debug!(host = %self.host, home = %home, "resolved remote home");
        self.inner.lock().unwrap().home = home;
        Ok(())
    }

    /// Disconnect: stop the reader, close both pipe ends and reap the
    /// child. Does nothing when already disconnected.
    pub fn disconnect(&self) {
        let _guard = self.connect_lock.lock().unwrap();
        self.teardown();
    }

    fn teardown(&self) {
        // Closing the outbound pipe first guarantees the child sees EOF
        // and exits, which in turn unblocks a reader stuck in a read.
        let reader = {
            let mut inner = self.inner.lock().unwrap();
            inner.quit = true;
            drop(inner.writer.take());
            inner.reader.take()
        };
        self.cond.notify_all();
        if let Some(handle) = reader {
            debug!(host = %self.host, "joining reader");
            let _ = handle.join();
        }
        let child = self.inner.lock().unwrap().child.take();
        if let Some(mut child) = child {
            debug!(host = %self.host, "waiting for ssh");
            let _ = child.wait();
        }
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    /// Allocate a request ID: the smallest ID at or above the cursor that
    /// is neither pending nor stashed. The ID is recorded in the waiting
    /// set so the reader knows to look for its reply.
    fn new_id(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        while inner.waiting.contains(&inner.next_id) || inner.replies.contains_key(&inner.next_id)
        {
            inner.next_id = inner.next_id.wrapping_add(1);
        }
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.waiting.insert(id);
        id
    }

    /// Write a finished packet to the outbound stream and wake the reader.
    fn send(&self, packet: Bytes) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| Error::protocol(format!("{}: not connected", self.host)))?;
        writer
            .write_all(&packet)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::io(format!("{}: write", self.host), e))?;
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    /// Block until the reply for `id` arrives and take it.
    fn await_reply(&self, id: u32) -> Result<Reply> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(reply) = inner.replies.remove(&id) {
                return Ok(reply);
            }
            if inner.quit || inner.failed {
                return Err(Error::ConnectionLost {
                    host: self.host.clone(),
                });
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Prefix relative paths with the remote home directory.
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.inner.lock().unwrap().home, path)
        }
    }

    /// Build an `Error::Sftp` from a STATUS body positioned after the ID.
    fn status_error(&self, r: &mut PacketReader<'_>, context: Option<&str>) -> Error {
        let parsed: Result<(u32, Vec<u8>)> = (|| Ok((r.get_u32()?, r.get_str()?)))();
        match parsed {
            Ok((status, msg)) => {
                let msg = String::from_utf8_lossy(&msg);
                let message = match context {
                    Some(c) => format!("{}: {}: {}", self.host, c, msg),
                    None => format!("{}: {}", self.host, msg),
                };
                Error::Sftp { status, message }
            }
            Err(e) => e,
        }
    }

    fn unexpected(&self, packet_type: u8) -> Error {
        Error::protocol(format!(
            "{}: unexpected SFTP response (type {})",
            self.host, packet_type
        ))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Open a remote file, returning the server's handle.
    pub fn open(&self, path: &str, mode: u32) -> Result<Vec<u8>> {
        debug!(host = %self.host, path, mode, "open");
        let full = self.resolve(path);
        let id = self.new_id();
        let mut p = PacketBuilder::new(FXP_OPEN);
        p.put_u32(id);
        p.put_str(full.as_bytes());
        p.put_u32(mode);
        p.put_u32(0); // no attributes
        self.send(p.finish())?;
        let reply = self.await_reply(id)?;
        let mut r = PacketReader::new(&reply.body);
        match reply.packet_type {
            FXP_HANDLE => r.get_str(),
            FXP_STATUS => Err(self.status_error(&mut r, Some(path))),
            other => Err(self.unexpected(other)),
        }
    }

    /// Open a remote directory. Version 3 has no distinct open mode for
    /// directories; this is an open with no access bits.
    pub fn opendir(&self, path: &str) -> Result<Vec<u8>> {
        self.open(path, 0)
    }

    /// Close a handle previously returned by `open`.
    pub fn close(&self, handle: &[u8]) -> Result<()> {
        debug!(host = %self.host, handle_len = handle.len(), "close");
        let id = self.new_id();
        let mut p = PacketBuilder::new(FXP_CLOSE);
        p.put_u32(id);
        p.put_str(handle);
        self.send(p.finish())?;
        let reply = self.await_reply(id)?;
        let mut r = PacketReader::new(&reply.body);
        match reply.packet_type {
            FXP_STATUS => {
                let err = self.status_error(&mut r, None);
                match err {
                    Error::Sftp { status: FX_OK, .. } => Ok(()),
                    other => Err(other),
                }
            }
            other => Err(self.unexpected(other)),
        }
    }

    pub fn stat(&self, path: &str) -> Result<Attributes> {
        debug!(host = %self.host, path, "stat");
        self.gstat(self.resolve(path).into_bytes(), FXP_STAT, Some(path))
    }

    pub fn lstat(&self, path: &str) -> Result<Attributes> {
        debug!(host = %self.host, path, "lstat");
        self.gstat(self.resolve(path).into_bytes(), FXP_LSTAT, Some(path))
    }

    pub fn fstat(&self, handle: &[u8]) -> Result<Attributes> {
        debug!(host = %self.host, handle_len = handle.len(), "fstat");
        self.gstat(handle.to_vec(), FXP_FSTAT, None)
    }

    fn gstat(&self, target: Vec<u8>, packet_type: u8, context: Option<&str>) -> Result<Attributes> {
        let id = self.new_id();
        let mut p = PacketBuilder::new(packet_type);
        p.put_u32(id);
        p.put_str(&target);
        self.send(p.finish())?;
        let reply = self.await_reply(id)?;
        let mut r = PacketReader::new(&reply.body);
        match reply.packet_type {
            FXP_ATTRS => Attributes::unpack(&mut r),
            FXP_STATUS => Err(self.status_error(&mut r, context)),
            other => Err(self.unexpected(other)),
        }
    }

    /// Canonicalize a path on the server. Sent verbatim: the handshake
    /// resolves `""` to learn the remote home directory.
    pub fn realpath(&self, path: &str) -> Result<String> {
        debug!(host = %self.host, path, "realpath");
        let id = self.new_id();
        let mut p = PacketBuilder::new(FXP_REALPATH);
        p.put_u32(id);
        p.put_str(path.as_bytes());
        self.send(p.finish())?;
        let reply = self.await_reply(id)?;
        let mut r = PacketReader::new(&reply.body);
        match reply.packet_type {
            FXP_NAME => {
                let count = r.get_u32()?;
                if count != 1 {
                    return Err(Error::protocol(format!(
                        "{}: REALPATH returned {} names",
                        self.host, count
                    )));
                }
                let name = r.get_str()?;
                Ok(String::from_utf8_lossy(&name).into_owned())
            }
            FXP_STATUS => Err(self.status_error(&mut r, Some(path))),
            other => Err(self.unexpected(other)),
        }
    }

    /// Issue a READ and return its ID without waiting for the reply.
    pub fn begin_read(&self, handle: &[u8], offset: u64, len: u32) -> Result<u32> {
        let id = self.new_id();
        debug!(host = %self.host, id, offset, len, "begin read");
        let mut p = PacketBuilder::new(FXP_READ);
        p.put_u32(id);
        p.put_str(handle);
        p.put_u64(offset);
        p.put_u32(len);
        self.send(p.finish())?;
        Ok(id)
    }

    /// Complete a read started with `begin_read`. EOF yields empty bytes.
    pub fn finish_read(&self, id: u32) -> Result<Vec<u8>> {
        let reply = self.await_reply(id)?;
        let mut r = PacketReader::new(&reply.body);
        match reply.packet_type {
            FXP_DATA => r.get_str(),
            FXP_STATUS => {
                let err = self.status_error(&mut r, None);
                match err {
                    Error::Sftp {
                        status: FX_EOF, ..
                    } => Ok(Vec::new()),
                    other => Err(other),
                }
            }
            other => Err(self.unexpected(other)),
        }
    }

    /// Issue a READDIR and return its ID without waiting for the reply.
    pub fn begin_readdir(&self, handle: &[u8]) -> Result<u32> {
        let id = self.new_id();
        debug!(host = %self.host, id, "begin readdir");
        let mut p = PacketBuilder::new(FXP_READDIR);
        p.put_u32(id);
        p.put_str(handle);
        self.send(p.finish())?;
        Ok(id)
    }

    /// Complete a directory read, appending decoded entries to `names`.
    /// Returns the number of entries appended; 0 signals end-of-directory.
    pub fn finish_readdir(&self, id: u32, names: &mut Vec<Attributes>) -> Result<u32> {
        let reply = self.await_reply(id)?;
        let mut r = PacketReader::new(&reply.body);
        match reply.packet_type {
            FXP_NAME => {
                let count = r.get_u32()?;
                for _ in 0..count {
                    names.push(Attributes::unpack_named(&mut r)?);
                }
                Ok(count)
            }
            FXP_STATUS => {
                let err = self.status_error(&mut r, None);
                match err {
                    Error::Sftp {
                        status: FX_EOF, ..
                    } => Ok(0),
                    other => Err(other),
                }
            }
            other => Err(self.unexpected(other)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Reader thread body: demultiplex inbound replies into the shared table.
///
/// Sleeps while nothing is outstanding; on any read error outside of
/// shutdown it marks the connection failed so awaiters are released.
fn reader_loop(conn: &Connection, mut input: BufReader<Box<dyn Read + Send>>) {
    loop {
        {
            let mut inner = conn.inner.lock().unwrap();
            loop {
                if inner.quit {
                    return;
                }
                if !inner.waiting.is_empty() {
                    break;
                }
                inner = conn.cond.wait(inner).unwrap();
            }
        }

        let stashed = read_packet(&mut input, &conn.host).and_then(|(packet_type, body)| {
            let mut body = Bytes::from(body);
            let mut r = PacketReader::new(&body);
            let id = r.get_u32()?;
            body.advance(4);
            Ok((id, Reply { packet_type, body }))
        });
        match stashed {
            Ok((id, reply)) => {
                let mut inner = conn.inner.lock().unwrap();
                debug!(host = %conn.host, id, packet_type = reply.packet_type, "stashing reply");
                inner.replies.insert(id, reply);
                inner.waiting.remove(&id);
                drop(inner);
                conn.cond.notify_all();
            }
            Err(err) => {
                let mut inner = conn.inner.lock().unwrap();
                if !inner.quit {
                    warn!(host = %conn.host, error = %err, "reader failed");
                    inner.failed = true;
                }
                // Detach: if this thread holds the last reference, Drop
                // runs here and must not try to join the reader itself.
                drop(inner.reader.take());
                drop(inner);
                conn.cond.notify_all();
                return;
            }
        }
    }
}

/// Read one complete packet: (type, body). The body includes the request
/// ID for reply packets. Clean EOF surfaces as `ConnectionLost`.
fn read_packet(input: &mut impl Read, host: &str) -> Result<(u8, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    read_exact(input, &mut len_buf, host)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(Error::protocol(format!("{host}: zero-length packet")));
    }
    if len > MAX_PACKET {
        return Err(Error::protocol(format!(
            "{host}: oversized packet ({len} bytes)"
        )));
    }
    let mut type_buf = [0u8; 1];
    read_exact(input, &mut type_buf, host)?;
    let mut body = vec![0u8; len - 1];
    read_exact(input, &mut body, host)?;
    Ok((type_buf[0], body))
}

fn read_exact(input: &mut impl Read, buf: &mut [u8], host: &str) -> Result<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost {
            host: host.to_string(),
        },
        _ => Error::io(format!("{host}: read"), e),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use remdiff_test_utils::MockSftpServer;
    use std::os::unix::net::UnixStream;

    #[test]
    fn connect_resolves_home() {
        let mut server = MockSftpServer::new().file("motd", b"hello\n".to_vec()).start();
        let conn = server.connect("mock").unwrap();
        assert_eq!(conn.home(), remdiff_test_utils::HOME);
        assert!(conn.connected());
        conn.disconnect();
        assert!(!conn.connected());
    }

    #[test]
    fn connect_is_idempotent() {
        let mut server = MockSftpServer::new().start();
        let conn = server.connect("mock").unwrap();
        // A second connect is a no-op; the spare transport goes unused.
        let (spare_a, spare_b) = UnixStream::pair().unwrap();
        conn.connect_with_transport(spare_a, spare_b).unwrap();
        assert!(conn.connected());
        conn.disconnect();
        conn.disconnect();
    }

    #[test]
    fn stat_decodes_attributes() {
        let mut server = MockSftpServer::new().file("motd", vec![7u8; 1234]).start();
        let conn = server.connect("mock").unwrap();
        let attrs = conn.stat("motd").unwrap();
        assert_eq!(attrs.size, 1234);
        assert!(!attrs.is_dir());
        conn.disconnect();
    }

    #[test]
    fn stat_missing_file_is_no_such_file() {
        let mut server = MockSftpServer::new().start();
        let conn = server.connect("mock").unwrap();
        let err = conn.stat("absent").unwrap_err();
        assert!(err.is_no_such_file(), "unexpected error: {err}");
        conn.disconnect();
    }

    #[test]
    fn stat_directory_sets_type_bits() {
        let mut server = MockSftpServer::new().dir("src").start();
        let conn = server.connect("mock").unwrap();
        assert!(conn.stat("src").unwrap().is_dir());
        conn.disconnect();
    }

    #[test]
    fn lstat_and_fstat_see_the_same_file() {
        let mut server = MockSftpServer::new().file("motd", vec![9u8; 77]).start();
        let conn = server.connect("mock").unwrap();
        assert_eq!(conn.lstat("motd").unwrap().size, 77);
        let handle = conn.open("motd", FXF_READ).unwrap();
        assert_eq!(conn.fstat(&handle).unwrap().size, 77);
        conn.close(&handle).unwrap();
        conn.disconnect();
    }

    #[test]
    fn read_to_eof_in_chunks() {
        let contents: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut server = MockSftpServer::new().file("data", contents.clone()).start();
        let conn = server.connect("mock").unwrap();

        let handle = conn.open("data", FXF_READ).unwrap();
        let mut got = Vec::new();
        let mut offset = 0u64;
        loop {
            let id = conn.begin_read(&handle, offset, 4096).unwrap();
            let chunk = conn.finish_read(id).unwrap();
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, contents);
        conn.close(&handle).unwrap();
        conn.disconnect();
    }

    #[test]
    fn begin_read_ids_are_unique() {
        let mut server = MockSftpServer::new().file("data", vec![1u8; 64]).start();
        let conn = server.connect("mock").unwrap();
        let handle = conn.open("data", FXF_READ).unwrap();
        let ids: Vec<u32> = (0..16)
            .map(|i| conn.begin_read(&handle, i * 16, 16).unwrap())
            .collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
        for id in ids {
            let _ = conn.finish_read(id);
        }
        conn.close(&handle).unwrap();
        conn.disconnect();
    }

    #[test]
    fn open_missing_file_raises_status() {
        let mut server = MockSftpServer::new().start();
        let conn = server.connect("mock").unwrap();
        let err = conn.open("nope", FXF_READ).unwrap_err();
        assert!(err.is_no_such_file());
        conn.disconnect();
    }

    #[test]
    fn readdir_appends_entries() {
        let mut server = MockSftpServer::new()
            .dir("d")
            .file("d/a", b"1".to_vec())
            .file("d/b", b"2".to_vec())
            .start();
        let conn = server.connect("mock").unwrap();
        let handle = conn.opendir("d").unwrap();
        let mut names = Vec::new();
        loop {
            let id = conn.begin_readdir(&handle).unwrap();
            if conn.finish_readdir(id, &mut names).unwrap() == 0 {
                break;
            }
        }
        let mut found: Vec<String> = names.iter().filter_map(|a| a.filename.clone()).collect();
        found.sort();
        assert_eq!(found, vec!["a".to_string(), "b".to_string()]);
        conn.close(&handle).unwrap();
        conn.disconnect();
    }

    // Raw scripted exchanges, for behaviour the mock server cannot force.

    fn version_packet(version: u32) -> Bytes {
        let mut p = PacketBuilder::new(FXP_VERSION);
        p.put_u32(version);
        p.finish()
    }

    fn name_packet(id: u32, name: &str) -> Bytes {
        let mut p = PacketBuilder::new(FXP_NAME);
        p.put_u32(id);
        p.put_u32(1);
        p.put_str(name.as_bytes());
        p.put_str(name.as_bytes());
        p.put_u32(0);
        p.finish()
    }

    fn data_packet(id: u32, data: &[u8]) -> Bytes {
        let mut p = PacketBuilder::new(FXP_DATA);
        p.put_u32(id);
        p.put_str(data);
        p.finish()
    }

    /// Reads one packet and returns (type, body-after-id, id).
    fn recv_request(input: &mut impl Read) -> (u8, Vec<u8>, u32) {
        let (packet_type, body) = read_packet(input, "script").unwrap();
        let mut r = PacketReader::new(&body);
        let id = r.get_u32().unwrap();
        (packet_type, body, id)
    }

    #[test]
    fn replies_are_routed_by_id_in_any_order() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let script = std::thread::spawn(move || {
            // Handshake.
            let (packet_type, _) = read_packet(&mut server, "script").unwrap();
            assert_eq!(packet_type, FXP_INIT);
            server.write_all(&version_packet(3)).unwrap();
            let (packet_type, _, id) = recv_request(&mut server);
            assert_eq!(packet_type, FXP_REALPATH);
            server.write_all(&name_packet(id, "/home/script")).unwrap();
            // Two reads; reply to the second one first.
            let (_, _, first) = recv_request(&mut server);
            let (_, _, second) = recv_request(&mut server);
            server.write_all(&data_packet(second, b"second")).unwrap();
            server.write_all(&data_packet(first, b"first")).unwrap();
        });

        let conn = Arc::new(Connection::new("script"));
        conn.connect_with_transport(client.try_clone().unwrap(), client)
            .unwrap();
        let id1 = conn.begin_read(b"h", 0, 16).unwrap();
        let id2 = conn.begin_read(b"h", 16, 16).unwrap();
        assert_eq!(conn.finish_read(id1).unwrap(), b"first");
        assert_eq!(conn.finish_read(id2).unwrap(), b"second");
        script.join().unwrap();
        conn.disconnect();
    }

    #[test]
    fn old_server_version_is_refused() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let script = std::thread::spawn(move || {
            let _ = read_packet(&mut server, "script").unwrap();
            server.write_all(&version_packet(2)).unwrap();
        });
        let conn = Arc::new(Connection::new("script"));
        let err = conn
            .connect_with_transport(client.try_clone().unwrap(), client)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }), "got {err}");
        assert!(!conn.connected());
        script.join().unwrap();
    }

    #[test]
    fn newer_server_version_is_accepted() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let script = std::thread::spawn(move || {
            let _ = read_packet(&mut server, "script").unwrap();
            server.write_all(&version_packet(6)).unwrap();
            let (_, _, id) = recv_request(&mut server);
            server.write_all(&name_packet(id, "/home/script")).unwrap();
        });
        let conn = Arc::new(Connection::new("script"));
        conn.connect_with_transport(client.try_clone().unwrap(), client)
            .unwrap();
        assert_eq!(conn.home(), "/home/script");
        script.join().unwrap();
        conn.disconnect();
    }

    #[test]
    fn non_version_reply_to_init_is_refused() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let script = std::thread::spawn(move || {
            let _ = read_packet(&mut server, "script").unwrap();
            server.write_all(&data_packet(0, b"garbage")).unwrap();
        });
        let conn = Arc::new(Connection::new("script"));
        let err = conn
            .connect_with_transport(client.try_clone().unwrap(), client)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }), "got {err}");
        script.join().unwrap();
    }

    #[test]
    fn reader_death_releases_awaiters() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let script = std::thread::spawn(move || {
            let _ = read_packet(&mut server, "script").unwrap();
            server.write_all(&version_packet(3)).unwrap();
            let (_, _, id) = recv_request(&mut server);
            server.write_all(&name_packet(id, "/home/script")).unwrap();
            // Swallow one read request, then hang up mid-conversation.
            let _ = recv_request(&mut server);
        });
        let conn = Arc::new(Connection::new("script"));
        conn.connect_with_transport(client.try_clone().unwrap(), client)
            .unwrap();
        let id = conn.begin_read(b"h", 0, 16).unwrap();
        let err = conn.finish_read(id).unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { .. }), "got {err}");
        script.join().unwrap();
        conn.disconnect();
    }
}
