//! In-process SFTP version 3 server.
//!
//! Serves an in-memory tree and records per-request statistics. Requests
//! are ingested by one thread and answered by another, so the number of
//! reads a client keeps in flight is observable: the ingest thread counts
//! a READ as outstanding from arrival until the answer thread has replied
//! to it, and `max_concurrent_reads` is the high-water mark.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remdiff_core::error::Result;
use remdiff_core::sftp::codec::{PacketBuilder, PacketReader};
use remdiff_core::sftp::consts::*;
use remdiff_core::sftp::Connection;

/// Home directory reported for `REALPATH("")`; relative client paths
/// resolve under it.
pub const HOME: &str = "/remote";

/// Snapshot of server-side counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub opens: usize,
    pub closes: usize,
    pub reads: usize,
    /// Most READ requests that were ever awaiting a reply at once.
    pub max_concurrent_reads: usize,
}

#[derive(Default)]
struct StatsInner {
    opens: usize,
    closes: usize,
    reads: usize,
    outstanding_reads: usize,
    max_concurrent_reads: usize,
}

/// Builder for the in-memory tree the server exposes.
pub struct MockSftpServer {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    read_delay: Duration,
}

impl MockSftpServer {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert(HOME.to_string());
        Self {
            files: HashMap::new(),
            dirs,
            read_delay: Duration::ZERO,
        }
    }

    /// Add a file; relative names live under the server's home directory.
    pub fn file(mut self, name: &str, contents: Vec<u8>) -> Self {
        self.files.insert(resolve(name), contents);
        self
    }

    /// Add a directory.
    pub fn dir(mut self, name: &str) -> Self {
        self.dirs.insert(resolve(name));
        self
    }

    /// Delay every READ reply, widening the window in which a pipelining
    /// client accumulates in-flight requests.
    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Start the server threads and return the client-side handle.
    pub fn start(self) -> ServerHandle {
        let (client, server) = UnixStream::pair().expect("socketpair");
        let stats = Arc::new(Mutex::new(StatsInner::default()));
        let (tx, rx) = mpsc::channel::<(u8, Vec<u8>)>();

        let ingest_stream = server.try_clone().expect("clone server stream");
        let ingest_stats = Arc::clone(&stats);
        let _ = std::thread::spawn(move || {
            let mut input = ingest_stream;
            while let Some((packet_type, body)) = read_packet(&mut input) {
                if packet_type == FXP_READ {
                    let mut s = ingest_stats.lock().unwrap();
                    s.outstanding_reads += 1;
                    s.max_concurrent_reads = s.max_concurrent_reads.max(s.outstanding_reads);
                }
                if tx.send((packet_type, body)).is_err() {
                    break;
                }
            }
            // tx drops here; the engine drains what is queued and exits.
        });

        let engine_stats = Arc::clone(&stats);
        let _ = std::thread::spawn(move || {
            let mut engine = Engine {
                files: self.files,
                dirs: self.dirs,
                read_delay: self.read_delay,
                stats: engine_stats,
                output: server,
                handles: HashMap::new(),
                next_handle: 0,
            };
            while let Ok((packet_type, body)) = rx.recv() {
                if engine.handle(packet_type, &body).is_err() {
                    break;
                }
            }
        });

        ServerHandle {
            client: Some(client),
            stats,
        }
    }
}

impl Default for MockSftpServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Running server; owns the client-side stream until taken.
///
/// The server threads exit once every client-side clone of the stream is
/// closed; they are not joined, so dropping the handle never blocks on a
/// connection the test left open.
pub struct ServerHandle {
    client: Option<UnixStream>,
    stats: Arc<Mutex<StatsInner>>,
}

impl ServerHandle {
    /// Build a `Connection` wired to this server.
    pub fn connect(&mut self, host: &str) -> Result<Arc<Connection>> {
        let stream = self.client.take().expect("transport already taken");
        let reader = stream
            .try_clone()
            .map_err(|e| remdiff_core::Error::io("clone stream", e))?;
        let conn = Arc::new(Connection::new(host));
        conn.connect_with_transport(reader, stream)?;
        Ok(conn)
    }

    pub fn stats(&self) -> ServerStats {
        let s = self.stats.lock().unwrap();
        ServerStats {
            opens: s.opens,
            closes: s.closes,
            reads: s.reads,
            max_concurrent_reads: s.max_concurrent_reads,
        }
    }
}

fn resolve(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{HOME}/{name}")
    }
}

struct OpenHandle {
    path: String,
    dir: bool,
    dir_listed: bool,
}

struct Engine {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    read_delay: Duration,
    stats: Arc<Mutex<StatsInner>>,
    output: UnixStream,
    handles: HashMap<Vec<u8>, OpenHandle>,
    next_handle: u32,
}

impl Engine {
    fn handle(&mut self, packet_type: u8, body: &[u8]) -> std::io::Result<()> {
        match packet_type {
            FXP_INIT => {
                let mut p = PacketBuilder::new(FXP_VERSION);
                p.put_u32(SFTP_VERSION);
                self.output.write_all(&p.finish())
            }
            FXP_REALPATH => {
                let mut r = PacketReader::new(body);
                let (id, path) = match parse_id_str(&mut r) {
                    Some(v) => v,
                    None => return Ok(()),
                };
                let resolved = if path.is_empty() {
                    HOME.to_string()
                } else {
                    resolve(&String::from_utf8_lossy(&path))
                };
                let mut p = PacketBuilder::new(FXP_NAME);
                p.put_u32(id);
                p.put_u32(1);
                p.put_str(resolved.as_bytes());
                p.put_str(resolved.as_bytes());
                p.put_u32(0);
                self.output.write_all(&p.finish())
            }
            FXP_OPEN => {
                let mut r = PacketReader::new(body);
                let (id, path) = match parse_id_str(&mut r) {
                    Some(v) => v,
                    None => return Ok(()),
                };
                let path = String::from_utf8_lossy(&path).into_owned();
                let dir = self.dirs.contains(&path);
                if !dir && !self.files.contains_key(&path) {
                    return self.status(id, FX_NO_SUCH_FILE, "no such file");
                }
                self.next_handle += 1;
                let handle = format!("h{}", self.next_handle).into_bytes();
                self.handles.insert(
                    handle.clone(),
                    OpenHandle {
                        path,
                        dir,
                        dir_listed: false,
                    },
                );
                self.stats.lock().unwrap().opens += 1;
                let mut p = PacketBuilder::new(FXP_HANDLE);
                p.put_u32(id);
                p.put_str(&handle);
                self.output.write_all(&p.finish())
            }
            FXP_CLOSE => {
                let mut r = PacketReader::new(body);
                let (id, handle) = match parse_id_str(&mut r) {
                    Some(v) => v,
                    None => return Ok(()),
                };
                if self.handles.remove(&handle).is_none() {
                    return self.status(id, FX_FAILURE, "bad handle");
                }
                self.stats.lock().unwrap().closes += 1;
                self.status(id, FX_OK, "ok")
            }
            FXP_READ => {
                let mut r = PacketReader::new(body);
                let parsed = (|| {
                    let id = r.get_u32().ok()?;
                    let handle = r.get_str().ok()?;
                    let offset = r.get_u64().ok()?;
                    let len = r.get_u32().ok()?;
                    Some((id, handle, offset, len))
                })();
                let (id, handle, offset, len) = match parsed {
                    Some(v) => v,
                    None => return Ok(()),
                };
                if !self.read_delay.is_zero() {
                    std::thread::sleep(self.read_delay);
                }
                let result = self.read_chunk(&handle, offset, len);
                {
                    let mut s = self.stats.lock().unwrap();
                    s.reads += 1;
                    s.outstanding_reads -= 1;
                }
                match result {
                    Ok(Some(chunk)) => {
                        let mut p = PacketBuilder::new(FXP_DATA);
                        p.put_u32(id);
                        p.put_str(&chunk);
                        self.output.write_all(&p.finish())
                    }
                    Ok(None) => self.status(id, FX_EOF, "end of file"),
                    Err(()) => self.status(id, FX_FAILURE, "bad handle"),
                }
            }
            FXP_STAT | FXP_LSTAT => {
                let mut r = PacketReader::new(body);
                let (id, path) = match parse_id_str(&mut r) {
                    Some(v) => v,
                    None => return Ok(()),
                };
                let path = String::from_utf8_lossy(&path).into_owned();
                let size = self.files.get(&path).map(|c| c.len() as u64);
                match size {
                    Some(size) => self.attrs(id, Some(size), 0o100644),
                    None if self.dirs.contains(&path) => self.attrs(id, None, 0o040755),
                    None => self.status(id, FX_NO_SUCH_FILE, "no such file"),
                }
            }
            FXP_FSTAT => {
                let mut r = PacketReader::new(body);
                let (id, handle) = match parse_id_str(&mut r) {
                    Some(v) => v,
                    None => return Ok(()),
                };
                let info = self
                    .handles
                    .get(&handle)
                    .map(|open| (open.dir, open.path.clone()));
                match info {
                    Some((true, _)) => self.attrs(id, None, 0o040755),
                    Some((false, path)) => {
                        let size = self.files.get(&path).map(|c| c.len() as u64);
                        self.attrs(id, size, 0o100644)
                    }
                    None => self.status(id, FX_FAILURE, "bad handle"),
                }
            }
            FXP_READDIR => {
                let mut r = PacketReader::new(body);
                let (id, handle) = match parse_id_str(&mut r) {
                    Some(v) => v,
                    None => return Ok(()),
                };
                let (path, listed) = match self.handles.get_mut(&handle) {
                    Some(open) if open.dir => {
                        let listed = open.dir_listed;
                        open.dir_listed = true;
                        (open.path.clone(), listed)
                    }
                    Some(_) => return self.status(id, FX_FAILURE, "not a directory"),
                    None => return self.status(id, FX_FAILURE, "bad handle"),
                };
                if listed {
                    return self.status(id, FX_EOF, "end of directory");
                }
                let prefix = format!("{path}/");
                let entries: Vec<(String, u64)> = self
                    .files
                    .iter()
                    .filter_map(|(p, contents)| {
                        let rest = p.strip_prefix(&prefix)?;
                        if rest.contains('/') {
                            return None;
                        }
                        Some((rest.to_string(), contents.len() as u64))
                    })
                    .collect();
                let mut p = PacketBuilder::new(FXP_NAME);
                p.put_u32(id);
                p.put_u32(entries.len() as u32);
                for (name, size) in entries {
                    p.put_str(name.as_bytes());
                    p.put_str(format!("-rw-r--r-- {size} {name}").as_bytes());
                    p.put_u32(ATTR_SIZE | ATTR_PERMISSIONS);
                    p.put_u64(size);
                    p.put_u32(0o100644);
                }
                self.output.write_all(&p.finish())
            }
            _ => {
                let mut r = PacketReader::new(body);
                match r.get_u32() {
                    Ok(id) => self.status(id, FX_OP_UNSUPPORTED, "operation unsupported"),
                    Err(_) => Ok(()),
                }
            }
        }
    }

    fn read_chunk(&self, handle: &[u8], offset: u64, len: u32) -> std::result::Result<Option<Vec<u8>>, ()> {
        let open = self.handles.get(handle).ok_or(())?;
        let contents = self.files.get(&open.path).ok_or(())?;
        let offset = offset as usize;
        if offset >= contents.len() {
            return Ok(None);
        }
        let end = contents.len().min(offset + len as usize);
        Ok(Some(contents[offset..end].to_vec()))
    }

    fn status(&mut self, id: u32, code: u32, message: &str) -> std::io::Result<()> {
        let mut p = PacketBuilder::new(FXP_STATUS);
        p.put_u32(id);
        p.put_u32(code);
        p.put_str(message.as_bytes());
        p.put_str(b""); // language tag
        self.output.write_all(&p.finish())
    }

    fn attrs(&mut self, id: u32, size: Option<u64>, permissions: u32) -> std::io::Result<()> {
        let mut p = PacketBuilder::new(FXP_ATTRS);
        p.put_u32(id);
        match size {
            Some(size) => {
                p.put_u32(ATTR_SIZE | ATTR_PERMISSIONS);
                p.put_u64(size);
                p.put_u32(permissions);
            }
            None => {
                p.put_u32(ATTR_PERMISSIONS);
                p.put_u32(permissions);
            }
        }
        self.output.write_all(&p.finish())
    }
}

fn parse_id_str(r: &mut PacketReader<'_>) -> Option<(u32, Vec<u8>)> {
    let id = r.get_u32().ok()?;
    let s = r.get_str().ok()?;
    Some((id, s))
}

/// Read one framed packet; None on EOF or any transport error.
fn read_packet(input: &mut impl Read) -> Option<(u8, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    input.read_exact(&mut len_buf).ok()?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_PACKET {
        return None;
    }
    let mut type_buf = [0u8; 1];
    input.read_exact(&mut type_buf).ok()?;
    let mut body = vec![0u8; len - 1];
    input.read_exact(&mut body).ok()?;
    Some((type_buf[0], body))
}
