//! On-disk layout and the JSON-lines event log behind
//! [`LocalEventStore::open`](crate::LocalEventStore::open).

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::event::EventRecord;

/// Manages the on-disk directory layout of a persistent store.
///
/// ```text
/// <base_dir>/
///     events.jsonl            -- global append-only log, one record per line
///     projections/
///         <projection_name>/
///             checkpoint.json
/// ```
///
/// `StoreLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    base_dir: PathBuf,
}

impl StoreLayout {
    /// Create a layout rooted at `base_dir`. The directory is created lazily
    /// by [`EventLog::open`].
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/events.jsonl`
    pub fn events_path(&self) -> PathBuf {
        self.base_dir.join("events.jsonl")
    }

    /// `<base_dir>/projections`
    pub fn projections_dir(&self) -> PathBuf {
        self.base_dir.join("projections")
    }

    /// `<base_dir>/projections/<name>`
    pub fn projection_dir(&self, name: &str) -> PathBuf {
        self.projections_dir().join(name)
    }
}

/// Append-only JSON-lines file holding every [`EventRecord`] in position
/// order.
#[derive(Debug)]
pub(crate) struct EventLog {
    path: PathBuf,
    file: File,
    /// Byte length of the acknowledged prefix of the file.
    len: u64,
    /// Set when a failed append could not be rolled back.
    failed: bool,
}

impl EventLog {
    /// Open (creating if needed) the log described by `layout` and read back
    /// every record it holds.
    ///
    /// A final line without a trailing newline is a torn write from a crash
    /// mid-append: it is logged, truncated away, and not returned. Any other
    /// unreadable line is fatal.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] on file-system failures, [`StoreError::Corrupt`]
    /// when a complete line does not parse or positions are out of sequence.
    pub(crate) fn open(layout: &StoreLayout) -> Result<(Self, Vec<EventRecord>), StoreError> {
        fs::create_dir_all(layout.base_dir())?;
        let path = layout.events_path();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (records, valid_len) = read_records(&file)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_len,
                "truncating torn write at end of event log"
            );
            file.set_len(valid_len)?;
        }
        let len = file.seek(SeekFrom::End(0))?;

        tracing::debug!(
            path = %path.display(),
            records = records.len(),
            "event log opened"
        );
        Ok((
            Self {
                path,
                file,
                len,
                failed: false,
            },
            records,
        ))
    }

    /// Append `records` as one write and flush them to disk.
    ///
    /// Either every record is durable or the file is cut back to its
    /// previous length.
    ///
    /// # Errors
    ///
    /// [`StoreError::Codec`] if a record cannot be serialized (nothing is
    /// written), [`StoreError::Io`] on write failure, or on every call after
    /// a failed write could not be rolled back.
    pub(crate) fn append(&mut self, records: &[EventRecord]) -> Result<(), StoreError> {
        self.append_with(records, |file, buf| {
            file.write_all(buf)?;
            file.sync_data()
        })
    }

    fn append_with<F>(&mut self, records: &[EventRecord], write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        if self.failed {
            return Err(io::Error::other(format!(
                "event log {} is unusable after a failed rollback",
                self.path.display()
            ))
            .into());
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        if let Err(e) = write(&mut self.file, &buf) {
            self.roll_back();
            return Err(e.into());
        }
        self.len += buf.len() as u64;
        Ok(())
    }

    /// Cut the file back to the last acknowledged append.
    fn roll_back(&mut self) {
        let restored = self
            .file
            .set_len(self.len)
            .and_then(|()| self.file.sync_data());
        match restored {
            Ok(()) => tracing::warn!(
                path = %self.path.display(),
                len = self.len,
                "event log append failed, rolled back"
            ),
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "event log rollback failed, refusing further appends"
                );
                self.failed = true;
            }
        }
    }
}

/// Parse every complete line of `file`. Returns the records and the byte
/// length of the valid prefix.
fn read_records(file: &File) -> Result<(Vec<EventRecord>, u64), StoreError> {
    let mut reader = BufReader::new(file);
    let mut records: Vec<EventRecord> = Vec::new();
    let mut valid_len = 0u64;
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        let complete = line.ends_with('\n');
        let trimmed = line.trim();

        if trimmed.is_empty() {
            if complete {
                valid_len += read as u64;
            }
            continue;
        }

        match serde_json::from_str::<EventRecord>(trimmed) {
            Ok(record) if complete => {
                let expected = records.len() as u64 + 1;
                if record.position != expected {
                    return Err(StoreError::Corrupt {
                        line: line_no,
                        reason: format!("expected position {expected}, found {}", record.position),
                    });
                }
                records.push(record);
                valid_len += read as u64;
            }
            // Incomplete last line: torn write, stop here.
            Ok(_) => break,
            Err(_) if !complete => break,
            Err(e) => {
                return Err(StoreError::Corrupt {
                    line: line_no,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok((records, valid_len))
}
