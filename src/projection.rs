//! Cross-stream projections (read models) over the global event log.
//!
//! A projection folds every record in global position order and keeps a
//! single cursor: the position of the last record it applied. Catching up
//! reads only what lies beyond that cursor, so a runner can be polled
//! repeatedly and never applies a record twice.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::event::EventRecord;
use crate::store::EventStore;

/// A cross-stream read model that consumes records from the global log.
///
/// Projections are eventually consistent: they catch up on demand and are
/// rebuilt from scratch if their checkpoint is unreadable.
///
/// # Contract
///
/// - [`apply`](Projection::apply) must be deterministic: given the same
///   sequence of records, it must produce the same state.
/// - Records of unknown types should be ignored for forward compatibility.
///   Filter on `record.event_type`, or decode with
///   [`decode`](crate::decode) and skip what does not decode.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Human-readable name, used as a directory name for checkpoints.
    const NAME: &'static str;

    /// Apply a single record from the global log.
    fn apply(&mut self, record: &EventRecord);
}

/// File name of a checkpoint inside its projection directory.
const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Persisted state of a projection including its cursor.
///
/// Serialized to JSON as `{ "state": <P>, "last_position": <N> }`, where
/// `N` is the position of the last applied record and `0` means none.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectionCheckpoint<P> {
    state: P,
    last_position: u64,
}

impl<P: Default> Default for ProjectionCheckpoint<P> {
    fn default() -> Self {
        Self {
            state: P::default(),
            last_position: 0,
        }
    }
}

impl<P: Projection> ProjectionCheckpoint<P> {
    /// Read the checkpoint in `dir`.
    ///
    /// A missing file is `None`. So is an unreadable one: the projection
    /// rebuilds from position 0 and the next save replaces it.
    fn read(dir: &Path) -> Result<Option<Self>, StoreError> {
        let path = dir.join(CHECKPOINT_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!(
                    projection = P::NAME,
                    path = %path.display(),
                    error = %e,
                    "unreadable projection checkpoint, rebuilding"
                );
                Ok(None)
            }
        }
    }

    /// Replace the checkpoint in `dir`, creating `dir` if needed.
    ///
    /// The new contents are synced to a sibling file first and renamed over
    /// the old one, so a crash leaves either the old or the new checkpoint.
    fn write(&self, dir: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(self)?;
        fs::create_dir_all(dir)?;
        let staged = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        let mut file = File::create(&staged)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&staged, dir.join(CHECKPOINT_FILE))?;
        Ok(())
    }
}

/// Drives a projection: loads its checkpoint, catches up on new records,
/// and saves the checkpoint back.
///
/// # Examples
///
/// ```
/// use askeda::{EventRecord, EventStore, LocalEventStore, Projection, ProjectionRunner};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Default, Clone, Serialize, Deserialize)]
/// struct Tally {
///     total: u64,
/// }
///
/// impl Projection for Tally {
///     const NAME: &'static str = "tally";
///     fn apply(&mut self, _record: &EventRecord) {
///         self.total += 1;
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = LocalEventStore::in_memory();
/// let mut runner = ProjectionRunner::<Tally>::new();
/// assert_eq!(runner.catch_up(&store).await?, 0);
/// assert_eq!(runner.state().total, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProjectionRunner<P: Projection> {
    /// The projection's state and cursor.
    checkpoint: ProjectionCheckpoint<P>,
    /// Where the checkpoint lives; `None` keeps it in memory only.
    checkpoint_dir: Option<PathBuf>,
}

impl<P: Projection> Default for ProjectionRunner<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Projection> ProjectionRunner<P> {
    /// An in-memory runner starting from an empty state at position 0.
    pub fn new() -> Self {
        Self {
            checkpoint: ProjectionCheckpoint::default(),
            checkpoint_dir: None,
        }
    }

    /// A runner checkpointed in `checkpoint_dir`, resuming from the
    /// checkpoint found there if any.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if reading an existing checkpoint file fails
    /// (other than file-not-found).
    pub fn with_checkpoint_dir(checkpoint_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let checkpoint_dir = checkpoint_dir.into();
        let checkpoint = ProjectionCheckpoint::<P>::read(&checkpoint_dir)?.unwrap_or_default();
        tracing::debug!(
            projection = P::NAME,
            position = checkpoint.last_position,
            "projection runner opened"
        );
        Ok(Self {
            checkpoint,
            checkpoint_dir: Some(checkpoint_dir),
        })
    }

    /// Returns the current projection state.
    pub fn state(&self) -> &P {
        &self.checkpoint.state
    }

    /// Position of the last applied record; `0` before the first.
    pub fn position(&self) -> u64 {
        self.checkpoint.last_position
    }

    /// Apply every record appended since the last catch-up, then save the
    /// checkpoint. Returns how many records were applied.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if reading the log or saving the checkpoint fails.
    /// Records applied before a save failure stay applied in memory.
    pub async fn catch_up(&mut self, store: &dyn EventStore) -> Result<usize, StoreError> {
        let records = store.load_since(self.checkpoint.last_position).await?;
        let mut applied = 0;
        for record in &records {
            if record.position <= self.checkpoint.last_position {
                continue;
            }
            self.checkpoint.state.apply(record);
            self.checkpoint.last_position = record.position;
            applied += 1;
        }

        if applied > 0 {
            tracing::debug!(
                projection = P::NAME,
                applied,
                position = self.checkpoint.last_position,
                "projection caught up"
            );
            self.save()?;
        }
        Ok(applied)
    }

    /// Persist the checkpoint. A no-op for in-memory runners.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if writing the checkpoint fails.
    pub fn save(&self) -> Result<(), StoreError> {
        match &self.checkpoint_dir {
            Some(dir) => self.checkpoint.write(dir),
            None => Ok(()),
        }
    }
}
