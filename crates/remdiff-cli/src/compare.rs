//! The comparison driver.
//!
//! Decides what local paths to hand to `diff`, spawns it, and proxies its
//! output. A remote operand becomes `/dev/fd/N`: the reader end of a pipe
//! whose writer end is fed by a background thread pulling pipelined SFTP
//! reads. Output lines are rewritten so diagnostics show the names the
//! user typed instead of the synthetic paths.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use regex::bytes::{NoExpand, Regex};
use tracing::{debug, warn};

use remdiff_core::error::{Error, Result};
use remdiff_core::fdio;
use remdiff_core::sftp::consts::FXF_READ;
use remdiff_core::sftp::{registry, Connection};

/// Limit on SFTP read requests a feeder keeps in flight.
const INFLIGHT_LIMIT: usize = 4;

/// Bytes requested per SFTP read.
const READ_CHUNK: u32 = 4096;

/// Output mode, mirroring diff's own mode options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Brief,
    /// Unified, with an optional context-line count (`-U NUM`).
    Unified(Option<u32>),
    SideBySide,
}

/// One output-rewrite rule; applied to each complete line in
/// registration order.
struct Replacement {
    pattern: Regex,
    replacement: Vec<u8>,
}

/// Context for one comparison.
pub struct Comparison {
    pub mode: Mode,
    /// Arguments passed through to diff.
    pub extra_args: Vec<String>,
    /// Substitute `/dev/null` for a missing operand, per position.
    pub new_as_empty: [bool; 2],
    /// Rewrite "Files ... are identical" diagnostics in normal mode.
    pub report_identical: bool,
    /// Per-comparison connection cache, consulted before the process-wide
    /// registry. Seedable, so tests can supply their own transports.
    conns: HashMap<String, Arc<Connection>>,
    feeders: Vec<JoinHandle<()>>,
    /// Reader ends of feeder pipes, closed once diff has finished.
    drain: Vec<OwnedFd>,
    rules: Vec<Replacement>,
}

impl Comparison {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            extra_args: Vec::new(),
            new_as_empty: [false, false],
            report_identical: false,
            conns: HashMap::new(),
            feeders: Vec::new(),
            drain: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Pre-seed the connection cache for `host`.
    pub fn insert_connection(&mut self, host: &str, conn: Arc<Connection>) {
        self.conns.insert(host.to_string(), conn);
    }

    /// Compare two files, writing diff's (rewritten) output to `out`.
    ///
    /// Returns diff's exit status: 0 identical, 1 different, 2 trouble.
    pub fn compare_files(&mut self, f1: &str, f2: &str, out: &mut dyn Write) -> Result<i32> {
        debug!(f1, f2, "comparing");
        let result = self.run(f1, f2, out);
        // Closing the reader ends makes any still-running feeder see a
        // broken pipe on its next write and wind down.
        self.drain_fds();
        self.join_feeders();
        result
    }

    fn run(&mut self, f1: &str, f2: &str, out: &mut dyn Write) -> Result<i32> {
        self.rules.clear();

        let mut args: Vec<String> = Vec::new();
        match self.mode {
            Mode::Normal => {}
            Mode::Unified(None) => args.push("-u".to_string()),
            Mode::Unified(Some(context)) => args.push(format!("-U{context}")),
            Mode::Brief => args.push("-q".to_string()),
            Mode::SideBySide => args.push("-y".to_string()),
        }
        args.extend(self.extra_args.iter().cloned());

        let n1 = self.add_file(f1, 0)?;
        let n2 = self.add_file(f2, 1)?;
        self.register_rules(f1, &n1, 0)?;
        self.register_rules(f2, &n2, 1)?;
        args.push(n1);
        args.push(n2);

        self.run_diff(&args, out)
    }

    /// Resolve one operand to the name diff will be given: the path
    /// itself for local files, `/dev/null` for permitted-missing files,
    /// or `/dev/fd/N` backed by a feeder for remote files.
    fn add_file(&mut self, f: &str, position: usize) -> Result<String> {
        match f.split_once(':') {
            None => self.add_local(f, position),
            Some((host, path)) => self.add_remote(f, host, path, position),
        }
    }

    fn add_local(&mut self, f: &str, position: usize) -> Result<String> {
        match std::fs::metadata(f) {
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.new_as_empty[position] => {
                Ok("/dev/null".to_string())
            }
            Err(e) => Err(Error::io(f.to_string(), e)),
            Ok(meta) if meta.is_dir() => Err(Error::IsDirectory(f.to_string())),
            Ok(_) => Ok(f.to_string()),
        }
    }

    fn add_remote(&mut self, f: &str, host: &str, path: &str, position: usize) -> Result<String> {
        let conn = match self.conns.get(host) {
            Some(conn) => Arc::clone(conn),
            None => {
                let conn = registry::connection(host)?;
                self.conns.insert(host.to_string(), Arc::clone(&conn));
                conn
            }
        };

        match conn.stat(path) {
            Ok(attrs) if attrs.is_dir() => return Err(Error::IsDirectory(f.to_string())),
            Ok(_) => {}
            Err(ref e) if e.is_no_such_file() && self.new_as_empty[position] => {
                return Ok("/dev/null".to_string());
            }
            Err(e) => return Err(e),
        }

        let handle = conn.open(path, FXF_READ)?;

        // diff gets the reader end as /dev/fd/N, so that end must stay
        // inheritable; only the writer end is marked close-on-exec.
        let (reader, writer) = fdio::pipe()?;
        fdio::close_on_exec(writer.as_raw_fd())?;

        let context = f.to_string();
        let feeder = std::thread::Builder::new()
            .name(format!("feeder-{host}"))
            .spawn(move || feed_file(conn, context, handle, writer))
            .map_err(|e| Error::io("spawn feeder", e))?;
        self.feeders.push(feeder);

        let synthetic = format!("/dev/fd/{}", reader.as_raw_fd());
        self.drain.push(reader);
        Ok(synthetic)
    }

    /// Register the rewrites that map a synthetic name back to the
    /// user-supplied one on diff's diagnostic lines.
    fn register_rules(&mut self, user: &str, synthetic: &str, position: usize) -> Result<()> {
        if synthetic == user {
            return Ok(());
        }
        match self.mode {
            Mode::Unified(_) => {
                // "--- old" / "+++ new" header lines.
                let marker = if position == 0 { "---" } else { "+++" };
                self.push_rule(
                    &format!("^{} {}", regex::escape(marker), regex::escape(synthetic)),
                    format!("{marker} {user}").into_bytes(),
                )?;
            }
            Mode::Brief => self.push_files_rule(user, synthetic, position)?,
            Mode::Normal if self.report_identical => {
                self.push_files_rule(user, synthetic, position)?;
            }
            // Normal and side-by-side output carries no filenames.
            _ => {}
        }
        Ok(())
    }

    /// "Files A and B differ" / "Files A and B are identical" lines.
    fn push_files_rule(&mut self, user: &str, synthetic: &str, position: usize) -> Result<()> {
        if position == 0 {
            self.push_rule(
                &format!("^Files {}", regex::escape(synthetic)),
                format!("Files {user}").into_bytes(),
            )
        } else {
            self.push_rule(
                &format!(" and {}", regex::escape(synthetic)),
                format!(" and {user}").into_bytes(),
            )
        }
    }

    fn push_rule(&mut self, pattern: &str, replacement: Vec<u8>) -> Result<()> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::protocol(format!("bad replacement pattern: {e}")))?;
        self.rules.push(Replacement {
            pattern,
            replacement,
        });
        Ok(())
    }

    /// Apply every rule, in order, to one complete output line.
    fn rewrite(&self, line: &[u8]) -> Vec<u8> {
        let mut current = line.to_vec();
        for rule in &self.rules {
            current = rule
                .pattern
                .replace(&current, NoExpand(&rule.replacement))
                .into_owned();
        }
        current
    }

    /// Spawn diff, proxy its output line by line through the rewrite
    /// rules, and return its exit status.
    fn run_diff(&mut self, args: &[String], out: &mut dyn Write) -> Result<i32> {
        debug!(?args, "running diff");
        let mut command = Command::new("diff");
        command.args(args).stdout(Stdio::piped());
        // SIGPIPE is ignored process-wide; diff needs the default back so
        // it dies promptly if we close the pipe early.
        unsafe {
            command.pre_exec(|| {
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                Ok(())
            });
        }
        let mut child = command
            .spawn()
            .map_err(|e| Error::io("spawn diff", e))?;
        let stdout = child.stdout.take().expect("child stdout is piped");

        let mut pipe = BufReader::new(stdout);
        let mut line: Vec<u8> = Vec::new();
        loop {
            line.clear();
            let n = pipe
                .read_until(b'\n', &mut line)
                .map_err(|e| Error::io("read diff output", e))?;
            if n == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                // diff's output is newline-terminated; drop a partial tail.
                break;
            }
            let rewritten = self.rewrite(&line);
            out.write_all(&rewritten)
                .map_err(|e| Error::io("write standard output", e))?;
        }

        let status = child.wait().map_err(|e| Error::io("wait for diff", e))?;
        if let Some(signal) = status.signal() {
            return Err(Error::io(
                "diff",
                io::Error::other(format!("killed by signal {signal}")),
            ));
        }
        Ok(status.code().unwrap_or(2))
    }

    fn drain_fds(&mut self) {
        self.drain.clear();
    }

    fn join_feeders(&mut self) {
        for feeder in self.feeders.drain(..) {
            let _ = feeder.join();
        }
    }
}

impl Drop for Comparison {
    fn drop(&mut self) {
        self.drain_fds();
        self.join_feeders();
    }
}

/// Feeder thread body: pump a remote file into the writer end of a pipe.
///
/// Keeps up to `INFLIGHT_LIMIT` reads outstanding; offsets advance by
/// `READ_CHUNK` as each request is issued. The first empty reply is EOF
/// (short server reads are treated the same way). A broken pipe means
/// diff stopped reading and ends the feed normally. On every exit path
/// the remaining in-flight reads are drained and the handle is closed.
fn feed_file(conn: Arc<Connection>, context: String, handle: Vec<u8>, writer: OwnedFd) {
    let mut ids: VecDeque<u32> = VecDeque::new();
    let mut offset: u64 = 0;

    let mut feed = || -> Result<()> {
        loop {
            while ids.len() < INFLIGHT_LIMIT {
                let id = conn.begin_read(&handle, offset, READ_CHUNK)?;
                offset += u64::from(READ_CHUNK);
                ids.push_back(id);
            }
            let Some(id) = ids.pop_front() else {
                return Ok(());
            };
            let data = conn.finish_read(id)?;
            if data.is_empty() {
                return Ok(());
            }
            if let Err(e) = fdio::write_all(writer.as_raw_fd(), &data) {
                if e.kind() == io::ErrorKind::BrokenPipe {
                    debug!(file = %context, "reader went away, stopping feed");
                    return Ok(());
                }
                return Err(Error::io(format!("{context}: write"), e));
            }
        }
    };
    if let Err(e) = feed() {
        warn!(file = %context, error = %e, "feed failed");
    }

    // Reap whatever is still in flight, then release the handle.
    for id in ids {
        let _ = conn.finish_read(id);
    }
    if let Err(e) = conn.close(&handle) {
        debug!(file = %context, error = %e, "close failed");
    }
    // Dropping `writer` closes the pipe; diff then sees EOF.
}

// =============================================================================
// Tests
// =============================================================================
