//! Append-only event store with optimistic concurrency.
//!
//! Every entity owns a stream whose versions start at 1 and grow by exactly
//! one per event, with no gaps. Every event also gets a one-based position in
//! a single global log, which is what projections read.
//!
//! Appends to one entity are linearized by a per-entity async mutex; appends
//! to different entities never wait on each other's version check. Only the
//! position assignment and the file write are serialized, on a blocking
//! thread so the runtime's workers never wait on `fsync`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::error::StoreError;
use crate::event::{EventRecord, ProposedEvent};
use crate::storage::{EventLog, StoreLayout};

/// The stream version a writer expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream must be at exactly this version. `Exact(0)` is equivalent
    /// to [`NoStream`](ExpectedVersion::NoStream).
    Exact(u64),
}

impl ExpectedVersion {
    /// Returns `true` if a stream at `current` satisfies this expectation.
    pub fn matches(self, current: u64) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current == 0,
            Self::Exact(v) => current == v,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any version"),
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(v) => write!(f, "version {v}"),
        }
    }
}

/// Durable, append-only storage of event records.
///
/// Implementations must make an appended record visible to every `load`
/// that starts after `append_all` returns.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append `events` to `entity_id`'s stream.
    ///
    /// Versions continue from the stream's current version; positions come
    /// from the global counter. Either every event is stored or none is.
    /// An empty batch only checks `expected`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ConcurrencyConflict`] when `expected` does not match.
    /// - [`StoreError::ForeignEvent`] when an event names another entity.
    /// - [`StoreError::Io`] / [`StoreError::Codec`] from a persistent backend.
    async fn append_all(
        &self,
        entity_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Append a single event, returning the version it was stored at.
    ///
    /// # Errors
    ///
    /// As for [`append_all`](EventStore::append_all).
    async fn append(
        &self,
        event: ProposedEvent,
        expected: ExpectedVersion,
    ) -> Result<u64, StoreError> {
        let entity_id = event.entity_id.clone();
        let records = self.append_all(&entity_id, expected, vec![event]).await?;
        Ok(records.last().map_or(0, |r| r.version))
    }

    /// Every record of `entity_id` in ascending version order.
    ///
    /// # Errors
    ///
    /// Backend-specific.
    async fn load(&self, entity_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        self.load_from(entity_id, 1).await
    }

    /// Records of `entity_id` with `version >= from_version`, ascending.
    ///
    /// # Errors
    ///
    /// Backend-specific.
    async fn load_from(
        &self,
        entity_id: &str,
        from_version: u64,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Every record in global append order, optionally only those whose
    /// `event_type` equals `event_type`.
    ///
    /// # Errors
    ///
    /// Backend-specific.
    async fn load_all(&self, event_type: Option<&str>) -> Result<Vec<EventRecord>, StoreError>;

    /// Records with a global position strictly greater than `position`.
    ///
    /// # Errors
    ///
    /// Backend-specific.
    async fn load_since(&self, position: u64) -> Result<Vec<EventRecord>, StoreError>;

    /// Current version of `entity_id`'s stream; `0` if it has no events.
    ///
    /// # Errors
    ///
    /// Backend-specific.
    async fn current_version(&self, entity_id: &str) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// LocalEventStore
// ---------------------------------------------------------------------------

/// Per-entity bookkeeping, guarded by that entity's async mutex.
#[derive(Debug, Default)]
struct StreamState {
    version: u64,
    /// Global positions of this stream's records, in version order.
    positions: Vec<u64>,
}

/// In-process event store, optionally backed by a JSON-lines file.
///
/// [`in_memory`](LocalEventStore::in_memory) keeps everything in memory.
/// [`open`](LocalEventStore::open) additionally writes every batch through
/// to `<dir>/events.jsonl` before acknowledging it, and replays that file on
/// start-up.
///
/// # Examples
///
/// ```
/// use askeda::{Envelope, EventStore, ExpectedVersion, LocalEventStore, encode};
/// use askeda::domain::customer::CustomerEvent;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = LocalEventStore::in_memory();
/// let event = CustomerEvent::CustomerIsPreferred { customer_id: "c1".into() };
/// let proposed = encode(&Envelope::new("c1", event))?;
///
/// let version = store.append(proposed, ExpectedVersion::NoStream).await?;
/// assert_eq!(version, 1);
/// assert_eq!(store.load("c1").await?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct LocalEventStore {
    streams: Mutex<HashMap<String, Arc<tokio::sync::Mutex<StreamState>>>>,
    /// Global log; index `i` holds position `i + 1`.
    log: Arc<RwLock<Vec<EventRecord>>>,
    /// Serializes position assignment and the durable write. Holds the
    /// backing file of a persistent store.
    writer: Arc<tokio::sync::Mutex<Option<EventLog>>>,
    layout: Option<StoreLayout>,
}

impl fmt::Debug for LocalEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEventStore")
            .field("base_dir", &self.layout.as_ref().map(StoreLayout::base_dir))
            .field("records", &self.read_log().len())
            .finish_non_exhaustive()
    }
}

impl LocalEventStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            log: Arc::new(RwLock::new(Vec::new())),
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            layout: None,
        }
    }

    /// Open (or create) a persistent store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if the directory or log cannot be opened,
    /// [`StoreError::Corrupt`] if the log is unreadable or its per-entity
    /// versions are not contiguous.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(dir.as_ref());
        let (file, records) = EventLog::open(&layout)?;

        let mut streams: HashMap<String, StreamState> = HashMap::new();
        for (i, record) in records.iter().enumerate() {
            let stream = streams.entry(record.entity_id.clone()).or_default();
            if record.version != stream.version + 1 {
                return Err(StoreError::Corrupt {
                    line: i + 1,
                    reason: format!(
                        "entity '{}' jumps from version {} to {}",
                        record.entity_id, stream.version, record.version
                    ),
                });
            }
            stream.version = record.version;
            stream.positions.push(record.position);
        }

        tracing::debug!(
            base_dir = %layout.base_dir().display(),
            streams = streams.len(),
            records = records.len(),
            "event store opened"
        );

        Ok(Self {
            streams: Mutex::new(
                streams
                    .into_iter()
                    .map(|(id, s)| (id, Arc::new(tokio::sync::Mutex::new(s))))
                    .collect(),
            ),
            log: Arc::new(RwLock::new(records)),
            writer: Arc::new(tokio::sync::Mutex::new(Some(file))),
            layout: Some(layout),
        })
    }

    /// Directory layout of a persistent store; `None` when in memory.
    pub fn layout(&self) -> Option<&StoreLayout> {
        self.layout.as_ref()
    }

    /// Total number of stored records.
    pub fn len(&self) -> usize {
        self.read_log().len()
    }

    /// Returns `true` when no event was ever appended.
    pub fn is_empty(&self) -> bool {
        self.read_log().is_empty()
    }

    /// The mutex guarding `entity_id`'s stream, created on first use.
    fn stream(&self, entity_id: &str) -> Arc<tokio::sync::Mutex<StreamState>> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(streams.entry(entity_id.to_owned()).or_default())
    }

    fn read_log(&self) -> std::sync::RwLockReadGuard<'_, Vec<EventRecord>> {
        read_log(&self.log)
    }
}

fn read_log(log: &RwLock<Vec<EventRecord>>) -> std::sync::RwLockReadGuard<'_, Vec<EventRecord>> {
    log.read().unwrap_or_else(PoisonError::into_inner)
}

/// Assign positions to `proposed`, persist them, and publish them to the
/// global log and to `stream`.
///
/// Owns both guards and never yields, so once started it runs to
/// completion even if the appending caller is dropped; the file, the log
/// and the stream cannot drift apart. A failed write leaves all three
/// untouched.
fn commit_batch(
    log: &RwLock<Vec<EventRecord>>,
    mut writer: OwnedMutexGuard<Option<EventLog>>,
    mut stream: OwnedMutexGuard<StreamState>,
    proposed: Vec<ProposedEvent>,
) -> Result<Vec<EventRecord>, StoreError> {
    let first_version = stream.version + 1;
    let first_position = read_log(log).len() as u64 + 1;
    let records: Vec<EventRecord> = proposed
        .into_iter()
        .zip(0u64..)
        .map(|(p, i)| p.into_record(first_version + i, first_position + i))
        .collect();

    if let Some(file) = writer.as_mut() {
        file.append(&records)?;
    }
    log.write()
        .unwrap_or_else(PoisonError::into_inner)
        .extend(records.iter().cloned());
    stream.positions.extend(records.iter().map(|r| r.position));
    stream.version += records.len() as u64;
    Ok(records)
}

#[async_trait]
impl EventStore for LocalEventStore {
    async fn append_all(
        &self,
        entity_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        if let Some(foreign) = events.iter().find(|e| e.entity_id != entity_id) {
            return Err(StoreError::ForeignEvent {
                entity_id: entity_id.to_owned(),
                found: foreign.entity_id.clone(),
            });
        }

        let state = self.stream(entity_id).lock_owned().await;

        if !expected.matches(state.version) {
            tracing::warn!(
                entity_id,
                %expected,
                actual = state.version,
                "concurrency conflict"
            );
            return Err(StoreError::ConcurrencyConflict {
                entity_id: entity_id.to_owned(),
                expected,
                actual: state.version,
            });
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let writer = Arc::clone(&self.writer).lock_owned().await;
        let records = if writer.is_some() {
            let log = Arc::clone(&self.log);
            tokio::task::spawn_blocking(move || commit_batch(&log, writer, state, events))
                .await
                .map_err(io::Error::other)??
        } else {
            commit_batch(&self.log, writer, state, events)?
        };

        tracing::debug!(
            entity_id,
            count = records.len(),
            version = records.last().map_or(0, |r| r.version),
            "events appended"
        );
        Ok(records)
    }

    async fn load_from(
        &self,
        entity_id: &str,
        from_version: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let stream = self.stream(entity_id);
        let state = stream.lock().await;
        let skip = from_version.saturating_sub(1) as usize;
        let log = self.read_log();
        Ok(state
            .positions
            .iter()
            .skip(skip)
            .filter_map(|p| log.get(*p as usize - 1).cloned())
            .collect())
    }

    async fn load_all(&self, event_type: Option<&str>) -> Result<Vec<EventRecord>, StoreError> {
        let log = self.read_log();
        Ok(log
            .iter()
            .filter(|r| event_type.is_none_or(|t| r.event_type == t))
            .cloned()
            .collect())
    }

    async fn load_since(&self, position: u64) -> Result<Vec<EventRecord>, StoreError> {
        let log = self.read_log();
        let start = usize::try_from(position).unwrap_or(usize::MAX).min(log.len());
        Ok(log[start..].to_vec())
    }

    async fn current_version(&self, entity_id: &str) -> Result<u64, StoreError> {
        let stream = self.stream(entity_id);
        let state = stream.lock().await;
        Ok(state.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::customer::CustomerEvent;
    use crate::event::{Envelope, encode};
    use tempfile::TempDir;

    fn proposed(entity_id: &str) -> ProposedEvent {
        encode(&Envelope::new(
            entity_id,
            CustomerEvent::CustomerIsPreferred {
                customer_id: entity_id.into(),
            },
        ))
        .expect("encode should succeed")
    }

    fn created(entity_id: &str) -> ProposedEvent {
        encode(&Envelope::new(
            entity_id,
            CustomerEvent::CustomerCreated {
                customer_id: entity_id.into(),
                name: "Ada".into(),
            },
        ))
        .expect("encode should succeed")
    }

    #[test]
    fn expected_version_matching() {
        assert!(ExpectedVersion::Any.matches(7));
        assert!(ExpectedVersion::NoStream.matches(0));
        assert!(!ExpectedVersion::NoStream.matches(1));
        assert!(ExpectedVersion::Exact(0).matches(0));
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
        assert_eq!(ExpectedVersion::Exact(3).to_string(), "version 3");
    }

    #[tokio::test]
    async fn versions_are_contiguous_per_entity() {
        let store = LocalEventStore::in_memory();
        let v1 = store
            .append(created("c1"), ExpectedVersion::NoStream)
            .await
            .expect("first append should succeed");
        let v2 = store
            .append(proposed("c1"), ExpectedVersion::Exact(1))
            .await
            .expect("second append should succeed");
        let other = store
            .append(created("c2"), ExpectedVersion::Any)
            .await
            .expect("other entity append should succeed");

        assert_eq!((v1, v2, other), (1, 2, 1));
        let versions: Vec<u64> = store
            .load("c1")
            .await
            .expect("load should succeed")
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(store.current_version("c1").await.expect("should succeed"), 2);
        assert_eq!(store.current_version("nobody").await.expect("should succeed"), 0);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts_without_writing() {
        let store = LocalEventStore::in_memory();
        store
            .append(created("c1"), ExpectedVersion::NoStream)
            .await
            .expect("append should succeed");

        let err = store
            .append_all("c1", ExpectedVersion::Exact(0), vec![proposed("c1"), proposed("c1")])
            .await
            .expect_err("stale version must conflict");
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict { actual: 1, expected: ExpectedVersion::Exact(0), .. }
        ));
        assert_eq!(store.len(), 1, "no partial append");
    }

    #[tokio::test]
    async fn batch_is_atomic_and_positions_are_global() {
        let store = LocalEventStore::in_memory();
        store
            .append(created("c2"), ExpectedVersion::Any)
            .await
            .expect("append should succeed");
        let records = store
            .append_all("c1", ExpectedVersion::NoStream, vec![created("c1"), proposed("c1")])
            .await
            .expect("batch append should succeed");

        let coords: Vec<(u64, u64)> = records.iter().map(|r| (r.version, r.position)).collect();
        assert_eq!(coords, vec![(1, 2), (2, 3)]);
    }

    #[tokio::test]
    async fn foreign_event_rejects_whole_batch() {
        let store = LocalEventStore::in_memory();
        let err = store
            .append_all("c1", ExpectedVersion::Any, vec![created("c1"), created("c2")])
            .await
            .expect_err("mixed batch must fail");
        assert!(matches!(err, StoreError::ForeignEvent { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn load_from_returns_suffix() {
        let store = LocalEventStore::in_memory();
        store
            .append_all(
                "c1",
                ExpectedVersion::NoStream,
                vec![created("c1"), proposed("c1"), proposed("c1")],
            )
            .await
            .expect("append should succeed");

        let tail = store.load_from("c1", 2).await.expect("load should succeed");
        assert_eq!(tail.iter().map(|r| r.version).collect::<Vec<_>>(), vec![2, 3]);
        assert!(store.load_from("c1", 9).await.expect("should succeed").is_empty());
    }

    #[tokio::test]
    async fn load_all_filters_by_type_in_global_order() {
        let store = LocalEventStore::in_memory();
        for id in ["c1", "c2"] {
            store
                .append(created(id), ExpectedVersion::NoStream)
                .await
                .expect("append should succeed");
            store
                .append(proposed(id), ExpectedVersion::Exact(1))
                .await
                .expect("append should succeed");
        }

        let all = store.load_all(None).await.expect("load_all should succeed");
        assert_eq!(
            all.iter().map(|r| r.position).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );

        let preferred = store
            .load_all(Some("customer_is_preferred"))
            .await
            .expect("filtered load should succeed");
        assert_eq!(
            preferred.iter().map(|r| r.entity_id.as_str()).collect::<Vec<_>>(),
            vec!["c1", "c2"]
        );

        let since = store.load_since(3).await.expect("load_since should succeed");
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].position, 4);
        assert!(store.load_since(99).await.expect("should succeed").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_with_same_expectation_admit_one() {
        let store = Arc::new(LocalEventStore::in_memory());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .append(created("c1"), ExpectedVersion::NoStream)
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.expect("task should join") {
                Ok(_) => ok += 1,
                Err(StoreError::ConcurrencyConflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((ok, conflicts), (1, 7));
        assert_eq!(store.current_version("c1").await.expect("should succeed"), 1);
    }

    #[tokio::test]
    async fn persistent_store_replays_on_open() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        {
            let store = LocalEventStore::open(tmp.path()).expect("open should succeed");
            store
                .append_all("c1", ExpectedVersion::NoStream, vec![created("c1"), proposed("c1")])
                .await
                .expect("append should succeed");
            store
                .append(created("c2"), ExpectedVersion::NoStream)
                .await
                .expect("append should succeed");
        }

        let store = LocalEventStore::open(tmp.path()).expect("reopen should succeed");
        assert_eq!(store.len(), 3);
        assert_eq!(store.current_version("c1").await.expect("should succeed"), 2);

        let v = store
            .append(proposed("c1"), ExpectedVersion::Exact(2))
            .await
            .expect("append after reopen should succeed");
        assert_eq!(v, 3);
        let since = store.load_since(3).await.expect("load_since should succeed");
        assert_eq!(since[0].position, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn persistent_appends_across_entities_interleave_cleanly() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = Arc::new(LocalEventStore::open(tmp.path()).expect("open should succeed"));
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let id = format!("c{i}");
                    store
                        .append(created(&id), ExpectedVersion::NoStream)
                        .await?;
                    store.append(proposed(&id), ExpectedVersion::Exact(1)).await
                })
            })
            .collect();
        for task in tasks {
            task.await
                .expect("task should join")
                .expect("append should succeed");
        }

        let positions: Vec<u64> = store
            .load_all(None)
            .await
            .expect("load_all should succeed")
            .iter()
            .map(|r| r.position)
            .collect();
        assert_eq!(positions, (1..=16).collect::<Vec<_>>());
        drop(store);

        let reopened = LocalEventStore::open(tmp.path()).expect("reopen should succeed");
        assert_eq!(reopened.len(), 16);
        for i in 0..8 {
            assert_eq!(
                reopened
                    .current_version(&format!("c{i}"))
                    .await
                    .expect("should succeed"),
                2
            );
        }
    }

    #[test]
    fn version_gap_in_file_is_corrupt() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StoreLayout::new(tmp.path());
        let record = created("c1").into_record(2, 1);
        let line = serde_json::to_string(&record).expect("serialize should succeed");
        std::fs::write(layout.events_path(), format!("{line}\n")).expect("write should succeed");

        let err = LocalEventStore::open(tmp.path()).expect_err("gap must be rejected");
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
    }
}
