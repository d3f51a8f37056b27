//! Mail log tailing.
//!
//! Reads the mail log incrementally from a [`LogCursor`] (byte offset plus
//! file identity) and counts lines matching the success and failure
//! patterns into collector-lifetime counters.
//!
//! # Cycle
//!
//! ```text
//! open + stat ── identity / length vs. cursor ──► resume offset (or 0 on rotation)
//!      │
//!      ├── on rotation: finish the renamed file from the old offset
//!      │
//!      └── read [offset, EOF) up to max_read_bytes, complete lines only
//!            │
//!            ├── 1. add matches to the counters
//!            └── 2. advance the cursor
//! ```
//!
//! The renamed file is found by identity: `<log>.1` first, then any sibling
//! whose name starts with the log's name. Compressed or deleted archives
//! cannot be matched and their unread tail is lost.
//!
//! Counters are updated before the cursor moves, so an interrupted cycle can
//! only re-count lines, never skip them.

use std::ffi::OsString;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use otrs_core::{CollectionError, CollectorResult, ConfigError, MailLogConfig, Sample};

use crate::traits::Collector;

/// Identity of a file on disk; changes when the log is rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            device: meta.dev(),
            inode: meta.ino(),
        }
    }

    /// Without inode numbers only truncation can reveal a rotation.
    #[cfg(not(unix))]
    pub fn of(_meta: &std::fs::Metadata) -> Self {
        Self { device: 0, inode: 0 }
    }
}

/// Read position in the mail log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCursor {
    pub offset: u64,
    /// `None` until the first successful stat.
    pub identity: Option<FileIdentity>,
}

/// Where the next read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// First time this collector sees a file.
    Fresh,
    /// Same file, continue at this offset.
    At(u64),
    /// Different file or truncated file; start over at 0.
    Rotated,
}

impl LogCursor {
    pub fn resume(&self, identity: FileIdentity, len: u64) -> Resume {
        match self.identity {
            None => Resume::Fresh,
            Some(known) if known == identity && len >= self.offset => Resume::At(self.offset),
            Some(_) => Resume::Rotated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Success,
    Failure,
}

/// Counts mail fetch successes and failures from the mail log.
pub struct MailLogCollector {
    path: PathBuf,
    success: Regex,
    failure: Regex,
    from_start: bool,
    max_read_bytes: u64,
    timeout: Duration,
    cursor: LogCursor,
    success_total: u64,
    failure_total: u64,
    rotations_total: u64,
}

impl MailLogCollector {
    pub fn new(config: &MailLogConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let success = Regex::new(&config.success_pattern).map_err(|source| ConfigError::Pattern {
            field: "success",
            source,
        })?;
        let failure = Regex::new(&config.failure_pattern).map_err(|source| ConfigError::Pattern {
            field: "failure",
            source,
        })?;
        Ok(Self {
            path: config.path.clone(),
            success,
            failure,
            from_start: config.from_start,
            max_read_bytes: config.max_read_bytes,
            timeout,
            cursor: LogCursor::default(),
            success_total: 0,
            failure_total: 0,
            rotations_total: 0,
        })
    }

    #[cfg(test)]
    fn cursor(&self) -> LogCursor {
        self.cursor
    }

    /// A failure match wins over a success match on the same line.
    fn classify(&self, line: &str) -> Option<LineKind> {
        if self.failure.is_match(line) {
            Some(LineKind::Failure)
        } else if self.success.is_match(line) {
            Some(LineKind::Success)
        } else {
            None
        }
    }

    fn tally(&self, bytes: &[u8]) -> Tally {
        let mut tally = Tally::default();
        for line in bytes.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            match self.classify(&String::from_utf8_lossy(line)) {
                Some(LineKind::Success) => tally.successes += 1,
                Some(LineKind::Failure) => tally.failures += 1,
                None => {}
            }
        }
        tally
    }

    /// Count what was appended to the rotated-away file after `previous`.
    ///
    /// Best effort: a file that cannot be found or read is logged and skipped.
    async fn drain_rotated(&self, previous: LogCursor) -> Tally {
        let Some(known) = previous.identity else {
            return Tally::default();
        };
        let Some(rotated) = self.find_rotated(known).await else {
            debug!(path = %self.path.display(), "rotated mail log not found, unread tail skipped");
            return Tally::default();
        };

        let buf = match read_file_from(&rotated, previous.offset, self.max_read_bytes).await {
            Ok(buf) => buf,
            Err(e) => {
                warn!(path = %rotated.display(), error = %e, "failed to read rotated mail log");
                return Tally::default();
            }
        };
        // The rotated file no longer grows, so a trailing partial line is final.
        let tally = self.tally(&buf[..complete_len(&buf, self.max_read_bytes, true)]);
        debug!(
            path = %rotated.display(),
            bytes = buf.len(),
            successes = tally.successes,
            failures = tally.failures,
            "rotated mail log drained"
        );
        tally
    }

    /// Locate the file that carries `known` identity next to the log.
    async fn find_rotated(&self, known: FileIdentity) -> Option<PathBuf> {
        let file_name = self.path.file_name()?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut first = OsString::from(file_name);
        first.push(".1");
        let first = dir.join(first);
        if has_identity(&first, known).await {
            return Some(first);
        }

        let prefix = file_name.to_string_lossy().into_owned();
        let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.as_os_str() == file_name || !name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let candidate = entry.path();
            if has_identity(&candidate, known).await {
                return Some(candidate);
            }
        }
        None
    }

    fn io_error(&self, source: std::io::Error) -> CollectionError {
        CollectionError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn samples(&self) -> Vec<Sample> {
        vec![
            Sample::counter("mail_fetch_success_total", self.success_total as f64),
            Sample::counter("mail_fetch_failure_total", self.failure_total as f64),
            Sample::counter("exporter_log_rotations_total", self.rotations_total as f64),
            Sample::gauge("exporter_log_cursor_bytes", self.cursor.offset as f64),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    successes: u64,
    failures: u64,
}

/// Read `[start, len)` of an open file, at most `budget` bytes.
async fn read_range(file: &mut File, start: u64, len: u64, budget: u64) -> std::io::Result<Vec<u8>> {
    let to_read = len.saturating_sub(start).min(budget);
    let mut buf = Vec::with_capacity(to_read as usize);
    if to_read > 0 {
        file.seek(SeekFrom::Start(start)).await?;
        (&mut *file).take(to_read).read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

async fn read_file_from(path: &Path, start: u64, budget: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    if len.saturating_sub(start) > budget {
        warn!(path = %path.display(), budget, "rotated mail log tail exceeds read budget, rest skipped");
    }
    read_range(&mut file, start, len, budget).await
}

async fn has_identity(path: &Path, known: FileIdentity) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && FileIdentity::of(&meta) == known,
        Err(_) => false,
    }
}

/// Length of the complete-line prefix of `buf`.
///
/// A trailing partial line waits for the next cycle unless it alone fills
/// the read budget, or the file is `finished` and will never grow.
fn complete_len(buf: &[u8], budget: u64, finished: bool) -> usize {
    match buf.iter().rposition(|b| *b == b'\n') {
        _ if finished => buf.len(),
        Some(pos) => pos + 1,
        None if buf.len() as u64 >= budget => buf.len(),
        None => 0,
    }
}

impl Collector for MailLogCollector {
    fn name(&self) -> &str {
        "maillog"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn collect(&mut self) -> CollectorResult {
        let mut file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CollectionError::FileNotFound(self.path.clone()));
            }
            Err(e) => return Err(self.io_error(e)),
        };
        let meta = file.metadata().await.map_err(|e| self.io_error(e))?;
        let identity = FileIdentity::of(&meta);
        let len = meta.len();

        let (start, rotated) = match self.cursor.resume(identity, len) {
            Resume::Fresh => (if self.from_start { 0 } else { len }, false),
            Resume::At(offset) => (offset, false),
            Resume::Rotated => (0, true),
        };

        // A renamed file still holds whatever was written after our last read.
        let mut tail = Tally::default();
        if rotated && self.cursor.identity != Some(identity) {
            tail = self.drain_rotated(self.cursor).await;
        }

        let buf = read_range(&mut file, start, len, self.max_read_bytes)
            .await
            .map_err(|e| self.io_error(e))?;
        let consumed = complete_len(&buf, self.max_read_bytes, false);
        let fresh = self.tally(&buf[..consumed]);

        self.success_total += tail.successes + fresh.successes;
        self.failure_total += tail.failures + fresh.failures;
        if rotated {
            self.rotations_total += 1;
            info!(
                path = %self.path.display(),
                recovered_lines = tail.successes + tail.failures,
                "mail log rotation detected"
            );
        }

        self.cursor = LogCursor {
            offset: start + consumed as u64,
            identity: Some(identity),
        };

        debug!(
            path = %self.path.display(),
            offset = self.cursor.offset,
            bytes = consumed,
            successes = fresh.successes,
            failures = fresh.failures,
            "mail log scanned"
        );

        Ok(self.samples())
    }
}
