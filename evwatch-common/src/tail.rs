//! Incremental tailing of a growing text file.
//!
//! A [`TailSession`] follows a file that another process appends to, one
//! complete line at a time. Bytes are read from the last read offset to EOF on
//! every poll and kept in a pending buffer; only text terminated by `\n` is
//! handed out, so a producer that is halfway through writing a line is never
//! observed as a torn line.
//!
//! The first bytes of the file and, on Unix, its device and inode are
//! remembered. A file that was truncated and rewritten past the read offset
//! between two polls, or replaced under the same path, fails the session
//! instead of handing out text from the middle of unrelated content.
//!
//! Polling never blocks. When no complete line is available the session
//! returns `Ok(None)` and the caller decides whether to sleep and poll again
//! or give up.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace};

/// Errors raised while tailing a file.
#[derive(Debug, Error)]
pub enum TailError {
    #[error("Failed to open {path} for tailing: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The producer truncated the file below what was already read.
    #[error("{path} shrank to {len} bytes, below read offset {offset}")]
    Truncated { path: PathBuf, len: u64, offset: u64 },

    /// The bytes already read changed, so the producer rewrote the file.
    #[error("{path} was rewritten below read offset {offset}")]
    Rewritten { path: PathBuf, offset: u64 },

    /// The path now names a different file than the one being tailed.
    #[error("{path} was replaced by another file")]
    Replaced { path: PathBuf },

    #[error("Tail session for {path} is closed")]
    Closed { path: PathBuf },
}

/// An open handle on a growing file plus the cursor into it.
///
/// The handle is released by [`TailSession::close`] or when the session is
/// dropped, whichever comes first.
#[derive(Debug)]
pub struct TailSession {
    path: PathBuf,
    file: Option<File>,
    /// Bytes pulled from the file so far (consumed plus pending).
    read_offset: u64,
    /// Bytes read but not yet handed out as complete lines.
    pending: Vec<u8>,
    /// Bytes handed out as complete lines, terminators included.
    cursor: u64,
    lines_yielded: u64,
    /// Up to [`HEAD_LEN`] leading bytes, re-checked before each read.
    head: Vec<u8>,
    identity: Option<FileIdentity>,
}

const HEAD_LEN: usize = 64;

/// Device and inode of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(metadata: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_metadata: &Metadata) -> Option<Self> {
        None
    }
}

impl TailSession {
    /// Open `path` for tailing from the beginning.
    ///
    /// An empty file is fine; the producer may not have written anything yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TailError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| TailError::Open {
            path: path.clone(),
            source,
        })?;

        let metadata = file.metadata().map_err(|source| TailError::Open {
            path: path.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(TailError::Open {
                path,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }

        debug!(path = %path.display(), "Opened tail session");
        Ok(Self {
            path,
            file: Some(file),
            read_offset: 0,
            pending: Vec::new(),
            cursor: 0,
            lines_yielded: 0,
            head: Vec::new(),
            identity: FileIdentity::of(&metadata),
        })
    }

    /// Path being tailed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset just past the last line handed out.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Number of complete lines handed out so far.
    pub fn lines_yielded(&self) -> u64 {
        self.lines_yielded
    }

    /// Whether bytes of an unterminated line are waiting for their newline.
    pub fn has_partial_line(&self) -> bool {
        !self.pending.is_empty() && memchr::memchr(b'\n', &self.pending).is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Return the next complete line, or `None` when caught up.
    ///
    /// The returned text excludes the `\n` terminator. Invalid UTF-8 is
    /// replaced lossily rather than treated as an error.
    pub fn poll(&mut self) -> Result<Option<String>, TailError> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        self.fill()?;
        Ok(self.take_line())
    }

    /// Iterate over the lines currently available.
    ///
    /// The iterator ends when the session is caught up or after yielding the
    /// first error. Calling `lines()` again later resumes from the cursor.
    pub fn lines(&mut self) -> Lines<'_> {
        Lines {
            session: self,
            failed: false,
        }
    }

    /// Collect every line currently available.
    pub fn drain(&mut self) -> Result<Vec<String>, TailError> {
        self.lines().collect()
    }

    /// Release the underlying handle. Safe to call more than once.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(
                path = %self.path.display(),
                cursor = self.cursor,
                lines = self.lines_yielded,
                "Closed tail session"
            );
        }
    }

    /// Read everything between the read offset and EOF into the pending buffer.
    fn fill(&mut self) -> Result<(), TailError> {
        let path = &self.path;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TailError::Closed { path: path.clone() })?;

        if let Some(identity) = self.identity {
            // A vanished path is fine; the open handle keeps the data readable.
            let current = fs::metadata(path).ok().and_then(|m| FileIdentity::of(&m));
            if current.is_some_and(|current| current != identity) {
                return Err(TailError::Replaced { path: path.clone() });
            }
        }

        let len = file
            .metadata()
            .map_err(|source| TailError::Read {
                path: path.clone(),
                source,
            })?
            .len();
        if len < self.read_offset {
            return Err(TailError::Truncated {
                path: path.clone(),
                len,
                offset: self.read_offset,
            });
        }
        if len == self.read_offset {
            return Ok(());
        }

        if !self.head.is_empty() {
            let mut head = vec![0; self.head.len()];
            file.seek(SeekFrom::Start(0))
                .and_then(|_| file.read_exact(&mut head))
                .map_err(|source| TailError::Read {
                    path: path.clone(),
                    source,
                })?;
            if head != self.head {
                return Err(TailError::Rewritten {
                    path: path.clone(),
                    offset: self.read_offset,
                });
            }
        }

        let start = self.pending.len();
        file.seek(SeekFrom::Start(self.read_offset))
            .map_err(|source| TailError::Read {
                path: path.clone(),
                source,
            })?;
        let read = file
            .read_to_end(&mut self.pending)
            .map_err(|source| TailError::Read {
                path: path.clone(),
                source,
            })?;

        if self.head.len() < HEAD_LEN {
            let missing = HEAD_LEN - self.head.len();
            let fresh = &self.pending[start..];
            self.head.extend_from_slice(&fresh[..missing.min(fresh.len())]);
        }
        self.read_offset += read as u64;
        trace!(path = %path.display(), read, offset = self.read_offset, "Read appended bytes");
        Ok(())
    }

    fn take_line(&mut self) -> Option<String> {
        let newline = memchr::memchr(b'\n', &self.pending)?;
        let line = String::from_utf8_lossy(&self.pending[..newline]).into_owned();
        self.pending.drain(..=newline);
        self.cursor += newline as u64 + 1;
        self.lines_yielded += 1;
        Some(line)
    }
}

impl Drop for TailSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Borrowing iterator over the lines available right now.
pub struct Lines<'a> {
    session: &'a mut TailSession,
    failed: bool,
}

impl Iterator for Lines<'_> {
    type Item = Result<String, TailError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.session.poll() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
