mod buffer;
mod conflict;
mod error;
pub mod hierarchy;
mod mutations;
mod queries;
pub mod spans;
mod store;

pub use buffer::BufferCalculator;
pub use conflict::checked_span;
pub use error::{EngineError, HierarchyError};
pub use hierarchy::{AffectedSetIndex, StructuralStalenessWarning, Structure, rebuild_affected_sets};
pub use mutations::NewBooking;
pub use spans::AffectingSpanIndex;

pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use tokio::sync::{Notify, RwLock, mpsc, oneshot};
use tracing::{error, info};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use store::InMemoryStore;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// one fsync answers the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into
    // the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// In-memory booking state made durable by the WAL, plus the two derived
/// indexes consumed on every validation path.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    affected: RwLock<Arc<AffectedSetIndex>>,
    pub(super) spans: AffectingSpanIndex,
    /// Bumped by every structural write.
    structural_version: AtomicU64,
    /// When the AffectedSet index first fell behind; 0 while current.
    stale_since: AtomicI64,
    structure_changed: Notify,
    /// Held shared by every write from WAL append to store apply, and
    /// exclusively by compaction while it snapshots and swaps the log.
    pub(super) write_gate: RwLock<()>,
    pub(super) buffers: BufferCalculator,
}

impl Engine {
    /// Replay the WAL, then build both derived indexes from the replayed
    /// state. Malformed structure leaves an empty AffectedSet index and marks
    /// it stale; bookings still index against their own units.
    pub fn new(wal_path: PathBuf, buffers: BufferCalculator) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        let mut structural_events = 0u64;
        for event in &events {
            if event.is_structural() {
                structural_events += 1;
            }
            store.apply_event(event);
        }

        let now = now_ms();
        let (affected, stale_since) =
            match rebuild_affected_sets(&store.structure(), structural_events, now) {
                Ok(index) => (index, 0),
                Err(e) => {
                    error!("affected-set index not built on startup: {e}");
                    (AffectedSetIndex::default(), now)
                }
            };
        let spans = AffectingSpanIndex::build(&store.bookings(), &affected, now);
        info!(
            events = events.len(),
            units = affected.unit_count(),
            span_rows = spans.row_count(),
            "engine state replayed"
        );

        Ok(Self {
            store,
            wal_tx,
            affected: RwLock::new(Arc::new(affected)),
            spans,
            structural_version: AtomicU64::new(structural_events),
            stale_since: AtomicI64::new(stale_since),
            structure_changed: Notify::new(),
            write_gate: RwLock::new(()),
            buffers,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply to the store. Structural events also mark the
    /// AffectedSet index stale.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_event(event);
        if event.is_structural() {
            self.structural_version.fetch_add(1, Ordering::SeqCst);
            let _ = self
                .stale_since
                .compare_exchange(0, now_ms(), Ordering::SeqCst, Ordering::SeqCst);
            self.structure_changed.notify_one();
        }
        Ok(())
    }

    /// The AffectedSet index currently serving reads.
    pub async fn affected_index(&self) -> Arc<AffectedSetIndex> {
        self.affected.read().await.clone()
    }

    /// Resolves after the next structural write (or immediately if one
    /// happened since the last wait).
    pub async fn structure_changed(&self) {
        self.structure_changed.notified().await;
    }

    pub fn structural_version(&self) -> u64 {
        self.structural_version.load(Ordering::SeqCst)
    }

    pub fn buffer_calculator(&self) -> &BufferCalculator {
        &self.buffers
    }

    /// Recompute every AffectedSet and install the result, then rebuild the
    /// affecting-time-span index against it. On malformed structure the
    /// previous index keeps serving.
    pub async fn rebuild_affected_sets(&self) -> Result<usize, HierarchyError> {
        let version = self.structural_version();
        let started = std::time::Instant::now();
        let index = match rebuild_affected_sets(&self.store.structure(), version, now_ms()) {
            Ok(index) => index,
            Err(e) => {
                metrics::counter!(crate::observability::AFFECTED_SET_REBUILD_FAILURES_TOTAL).increment(1);
                error!("affected-set rebuild aborted: {e}");
                return Err(e);
            }
        };
        let units = index.unit_count();
        {
            let mut current = self.affected.write().await;
            if current.version > version {
                return Ok(current.unit_count());
            }
            *current = Arc::new(index);
        }
        if self.structural_version() == version {
            self.stale_since.store(0, Ordering::SeqCst);
        }
        metrics::histogram!(crate::observability::AFFECTED_SET_REBUILD_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(version, units, "affected-set index rebuilt");

        self.rebuild_affecting_time_spans().await;
        Ok(units)
    }

    /// Whether structural writes happened since the serving index was built.
    pub async fn is_structure_stale(&self) -> bool {
        self.affected.read().await.version < self.structural_version()
    }

    /// A warning if the index has lagged the structure for longer than
    /// `bound_ms`.
    pub async fn staleness_warning(&self, bound_ms: Ms, now: Ms) -> Option<StructuralStalenessWarning> {
        let index_version = self.affected.read().await.version;
        let current_version = self.structural_version();
        let since = self.stale_since.load(Ordering::SeqCst);
        if index_version >= current_version || since == 0 {
            return None;
        }
        let stale_for_ms = now - since;
        (stale_for_ms > bound_ms).then_some(StructuralStalenessWarning {
            index_version,
            current_version,
            stale_for_ms,
        })
    }

    /// Full rebuild of the affecting-time-span index; the correctness
    /// backstop behind incremental refresh.
    pub async fn rebuild_affecting_time_spans(&self) -> usize {
        let affected = self.affected_index().await;
        let rows = self
            .spans
            .rebuild(|| self.store.bookings(), &affected, now_ms())
            .await;
        metrics::gauge!(crate::observability::SPAN_ROWS).set(rows as f64);
        tracing::debug!(rows, "affecting-time-span index rebuilt");
        rows
    }

    /// Recompute the index rows of one booking from its committed state.
    pub async fn refresh_affecting_time_spans(&self, booking_id: Ulid) -> usize {
        let affected = self.affected_index().await;
        self.spans
            .refresh(booking_id, || self.store.get_booking(&booking_id), &affected, now_ms())
            .await
    }

    /// Drop index rows whose buffered end has passed.
    pub async fn prune_affecting_time_spans(&self, now: Ms) -> usize {
        let pruned = self.spans.prune(now).await;
        metrics::gauge!(crate::observability::SPAN_ROWS).set(self.spans.row_count() as f64);
        pruned
    }
}
