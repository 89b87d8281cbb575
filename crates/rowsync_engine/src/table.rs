//! Mirrored table orchestrator.

use crate::backend::RemoteBackend;
use crate::backup::{BackupTicket, PessimisticWriteLog, Rollback, Settlement};
use crate::cache::{RowCache, Snapshot, Subscription};
use crate::config::TableConfig;
use crate::error::{SyncError, SyncResult};
use crate::fetcher::{LoadReport, PageFetcher};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use rowsync_protocol::{ChangeEvent, RowId, TableRow};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a mirrored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableState {
    /// Created, `init` not yet called.
    Uninitialized,
    /// Initial load in progress; push events are buffered.
    Loading,
    /// Loaded and applying push events.
    Live,
    /// Shut down; mutations are refused.
    Closed,
}

impl TableState {
    /// Returns true if the table accepts mutations.
    pub fn is_open(&self) -> bool {
        !matches!(self, TableState::Closed)
    }
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableState::Uninitialized => "uninitialized",
            TableState::Loading => "loading",
            TableState::Live => "live",
            TableState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Counters for a mirrored table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableStats {
    /// Rows received by the initial load.
    pub rows_loaded: u64,
    /// Pages requested by the initial load.
    pub pages_fetched: u64,
    /// Whether the initial load stopped early.
    pub load_aborted: bool,
    /// Push events upserted into the cache.
    pub events_applied: u64,
    /// Push deletes applied.
    pub events_removed: u64,
    /// Push events that evicted a row no longer in scope.
    pub events_evicted: u64,
    /// Push echoes dropped while a local write was in flight.
    pub events_suppressed: u64,
    /// Push payloads that could not be decoded.
    pub malformed_payloads: u64,
    /// Remote writes that succeeded.
    pub mutations_confirmed: u64,
    /// Remote writes that failed.
    pub mutations_failed: u64,
    /// Cache corrections made after failed optimistic writes.
    pub rollbacks: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// What a push event did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PushOutcome {
    /// The row was inserted or replaced.
    Applied,
    /// The row no longer matched the conditions and was removed.
    Evicted,
    /// A delete was applied.
    Removed,
    /// The event echoed a write still in flight and was dropped.
    Suppressed,
}

/// Result of a table mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    /// Wall-clock time the mutation was issued, in Unix milliseconds.
    pub issued_at_ms: u64,
    /// Whether the remote accepted the write.
    pub success: bool,
}

#[derive(Debug, Clone, Copy)]
enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }
}

struct Shared<R: TableRow> {
    config: TableConfig,
    cache: Arc<RowCache<R>>,
    backups: PessimisticWriteLog<R>,
    /// Serialises every check-then-change of the cache and the write log.
    /// Never held across an `.await`.
    apply: ReentrantMutex<()>,
    state: RwLock<TableState>,
    stats: RwLock<TableStats>,
}

impl<R: TableRow> Shared<R> {
    fn is_relevant(&self, row: &R) -> bool {
        self.config
            .prefilter
            .as_ref()
            .map_or(true, |p| p.matches(row))
            && self.config.conditions.matches(row)
    }

    /// Upserts `row` if it is in scope, otherwise removes its identity.
    /// Returns true if the row was kept.
    fn apply_local(&self, row: R) -> bool {
        let _apply = self.apply.lock();
        if self.is_relevant(&row) {
            self.cache.upsert(row);
            true
        } else {
            let id = self.cache.identity_of(&row);
            self.cache.delete(&id);
            false
        }
    }

    fn remove_local(&self, id: &RowId) {
        let _apply = self.apply.lock();
        self.cache.delete(id);
    }

    /// Backs up `id` and applies the speculative change as one step.
    fn speculate(&self, id: &RowId, change: impl FnOnce(&Self)) -> BackupTicket {
        let _apply = self.apply.lock();
        let ticket = self.backups.backup(id, self.cache.get(id));
        change(self);
        ticket
    }

    fn handle_push(&self, event: ChangeEvent<R>) -> PushOutcome {
        let id = self.cache.identity_of(&event.row);
        let table = self.config.table.as_str();

        let apply = self.apply.lock();
        let outcome = if !self.is_relevant(&event.row) {
            debug!(table, id = %id, kind = ?event.kind, "evicting row outside conditions");
            self.cache.delete(&id);
            PushOutcome::Evicted
        } else if !event.kind.is_write() {
            debug!(table, id = %id, "applying remote delete");
            self.cache.delete(&id);
            PushOutcome::Removed
        } else if event.is_remote() && self.backups.has(&id) {
            debug!(table, id = %id, "dropping echo of in-flight write");
            PushOutcome::Suppressed
        } else {
            debug!(table, id = %id, kind = ?event.kind, "applying remote write");
            self.cache.upsert(event.row);
            PushOutcome::Applied
        };
        drop(apply);

        let mut stats = self.stats.write();
        match outcome {
            PushOutcome::Applied => stats.events_applied += 1,
            PushOutcome::Evicted => stats.events_evicted += 1,
            PushOutcome::Removed => stats.events_removed += 1,
            PushOutcome::Suppressed => stats.events_suppressed += 1,
        }
        outcome
    }

    fn state(&self) -> TableState {
        *self.state.read()
    }

    fn set_state(&self, state: TableState) {
        *self.state.write() = state;
    }
}

/// A remote table mirrored into a local cache.
///
/// Loads the scoped rows once, then keeps the cache current from the push
/// channel and from local mutations.
pub struct TableSync<R: TableRow, B: RemoteBackend<R>> {
    shared: Arc<Shared<R>>,
    backend: Arc<B>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<R: TableRow, B: RemoteBackend<R>> TableSync<R, B> {
    /// Creates a table over `backend`. Nothing is fetched until [`init`].
    ///
    /// [`init`]: TableSync::init
    pub fn new(config: TableConfig, backend: Arc<B>) -> Self {
        let cache = Arc::new(RowCache::new(Arc::clone(&config.key_schema)));
        Self {
            shared: Arc::new(Shared {
                config,
                cache,
                backups: PessimisticWriteLog::new(),
                apply: ReentrantMutex::new(()),
                state: RwLock::new(TableState::Uninitialized),
                stats: RwLock::new(TableStats::default()),
            }),
            backend,
            listener: Mutex::new(None),
        }
    }

    /// Opens the push channel, loads the scoped rows and starts applying
    /// push events.
    ///
    /// The channel is opened before loading, so no change made during the
    /// load is missed. Load errors are logged and end the load early; they
    /// do not fail `init`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] unless the table is
    /// uninitialized, and the transport error if the channel cannot be
    /// opened. A failed subscription leaves the table closed.
    pub async fn init(&self) -> SyncResult<LoadReport> {
        self.transition(TableState::Uninitialized, TableState::Loading)?;
        let config = &self.shared.config;
        info!(table = %config.table, "initializing table");

        let mut channel = match self.backend.subscribe_channel(&config.channel_spec()).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(table = %config.table, error = %e, "push channel unavailable");
                self.shared.set_state(TableState::Closed);
                self.shared.stats.write().last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let shared = &self.shared;
        let report = PageFetcher::new(config.page_size)
            .load(self.backend.as_ref(), &config.scoped_query(), |row| {
                shared.apply_local(row);
            })
            .await;

        {
            let mut stats = self.shared.stats.write();
            stats.rows_loaded += report.fetched;
            stats.pages_fetched += report.pages;
            stats.load_aborted = report.aborted;
        }

        let listener = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            while let Some(event) = channel.next().await {
                listener.handle_push(event);
            }
            debug!(table = %listener.config.table, "push channel ended");
        });

        if let Err(e) = self.transition(TableState::Loading, TableState::Live) {
            // Closed while loading.
            handle.abort();
            return Err(e);
        }
        *self.listener.lock() = Some(handle);

        info!(
            table = %config.table,
            rows = self.shared.cache.len(),
            pages = report.pages,
            aborted = report.aborted,
            "table live"
        );
        Ok(report)
    }

    /// Stops the push listener and refuses further mutations.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.shared.state.write(), TableState::Closed);
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        if previous != TableState::Closed {
            info!(table = %self.shared.config.table, "table closed");
        }
    }

    /// Applies one push event to the cache.
    pub fn handle_push(&self, event: ChangeEvent<R>) -> PushOutcome {
        self.shared.handle_push(event)
    }

    /// Inserts a row.
    ///
    /// In optimistic mode the row is visible immediately and removed again
    /// if the remote rejects it. Otherwise the row only appears once the
    /// load or the push channel delivers it.
    ///
    /// # Errors
    ///
    /// Remote failures are reported through [`MutationOutcome::success`].
    /// Returns [`SyncError::TableClosed`] on a closed table and
    /// [`SyncError::BackupInvariant`] if the write log is corrupted.
    pub async fn insert(&self, row: R) -> SyncResult<MutationOutcome> {
        self.ensure_open()?;
        let issued_at_ms = now_ms();
        let id = self.identity_of(&row);
        let table = self.shared.config.table.as_str();

        let success = if self.shared.config.optimistic {
            let ticket = self.shared.speculate(&id, |shared| {
                shared.apply_local(row.clone());
            });
            let result = self.backend.insert(table, &row).await;
            self.settle(ticket, WriteKind::Insert, result)?
        } else {
            let result = self.backend.insert(table, &row).await;
            self.record(WriteKind::Insert, &id, result)
        };

        Ok(MutationOutcome {
            issued_at_ms,
            success,
        })
    }

    /// Inserts or replaces a row on the remote.
    ///
    /// In optimistic mode the new value is applied first and rolled back on
    /// failure. Otherwise the cache is updated once the remote confirms.
    ///
    /// # Errors
    ///
    /// As [`insert`](TableSync::insert).
    pub async fn update(&self, row: R) -> SyncResult<MutationOutcome> {
        self.ensure_open()?;
        let issued_at_ms = now_ms();
        let id = self.identity_of(&row);
        let table = self.shared.config.table.as_str();

        let success = if self.shared.config.optimistic {
            let ticket = self.shared.speculate(&id, |shared| {
                shared.apply_local(row.clone());
            });
            let result = self.backend.upsert(table, &row).await;
            self.settle(ticket, WriteKind::Update, result)?
        } else {
            let result = self.backend.upsert(table, &row).await;
            let success = self.record(WriteKind::Update, &id, result);
            if success {
                self.shared.apply_local(row);
            }
            success
        };

        Ok(MutationOutcome {
            issued_at_ms,
            success,
        })
    }

    /// Deletes the row with the same key as `row`.
    ///
    /// # Errors
    ///
    /// As [`insert`](TableSync::insert).
    pub async fn delete(&self, row: &R) -> SyncResult<MutationOutcome> {
        self.ensure_open()?;
        let issued_at_ms = now_ms();
        let id = self.identity_of(row);
        let key = self.shared.config.key_schema.matcher(row);
        let table = self.shared.config.table.as_str();

        let success = if self.shared.config.optimistic {
            let ticket = self.shared.speculate(&id, |shared| shared.remove_local(&id));
            let result = self.backend.delete(table, &key).await;
            self.settle(ticket, WriteKind::Delete, result)?
        } else {
            let result = self.backend.delete(table, &key).await;
            let success = self.record(WriteKind::Delete, &id, result);
            if success {
                self.shared.remove_local(&id);
            }
            success
        };

        Ok(MutationOutcome {
            issued_at_ms,
            success,
        })
    }

    /// Returns the table's cache.
    pub fn cache(&self) -> &Arc<RowCache<R>> {
        &self.shared.cache
    }

    /// Gets a cached row by identity.
    pub fn get(&self, id: &RowId) -> Option<R> {
        self.shared.cache.get(id)
    }

    /// Returns the oldest cached row.
    pub fn get_first(&self) -> Option<R> {
        self.shared.cache.get_first()
    }

    /// Registers a snapshot listener on the cache.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot<R>) + Send + Sync + 'static,
    {
        self.shared.cache.subscribe(callback)
    }

    /// Derives the identity of `row`.
    pub fn identity_of(&self, row: &R) -> RowId {
        self.shared.cache.identity_of(row)
    }

    /// Returns the current state.
    pub fn state(&self) -> TableState {
        self.shared.state()
    }

    /// Returns the current counters.
    pub fn stats(&self) -> TableStats {
        self.shared.stats.read().clone()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TableConfig {
        &self.shared.config
    }

    /// Number of rows with optimistic writes in flight.
    pub fn pending_writes(&self) -> usize {
        self.shared.backups.len()
    }

    fn transition(&self, from: TableState, to: TableState) -> SyncResult<()> {
        let mut state = self.shared.state.write();
        if *state != from {
            return Err(SyncError::InvalidStateTransition {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.state().is_open() {
            Ok(())
        } else {
            Err(SyncError::TableClosed)
        }
    }

    /// Releases `ticket` and corrects the cache. Returns the remote outcome.
    fn settle(
        &self,
        ticket: BackupTicket,
        kind: WriteKind,
        result: SyncResult<()>,
    ) -> SyncResult<bool> {
        let id = ticket.id().clone();
        let apply = self.shared.apply.lock();
        let rollback = self.shared.backups.release(ticket, Settlement::of(&result))?;

        match rollback {
            Rollback::Keep => {}
            Rollback::Restore(row) => {
                debug!(table = %self.shared.config.table, id = %id, op = kind.as_str(), "restoring row");
                self.shared.cache.upsert(row);
                self.shared.stats.write().rollbacks += 1;
            }
            Rollback::Remove => {
                debug!(table = %self.shared.config.table, id = %id, op = kind.as_str(), "removing row");
                self.shared.cache.delete(&id);
                self.shared.stats.write().rollbacks += 1;
            }
        }
        drop(apply);

        Ok(self.record(kind, &id, result))
    }

    fn record(&self, kind: WriteKind, id: &RowId, result: SyncResult<()>) -> bool {
        let mut stats = self.shared.stats.write();
        match result {
            Ok(()) => {
                stats.mutations_confirmed += 1;
                debug!(table = %self.shared.config.table, id = %id, op = kind.as_str(), "write confirmed");
                true
            }
            Err(e) => {
                stats.mutations_failed += 1;
                stats.last_error = Some(e.to_string());
                warn!(
                    table = %self.shared.config.table,
                    id = %id,
                    op = kind.as_str(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "remote write failed"
                );
                false
            }
        }
    }
}

impl<R, B> TableSync<R, B>
where
    R: TableRow + DeserializeOwned,
    B: RemoteBackend<R>,
{
    /// Decodes a JSON push payload and applies it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Protocol`] for a malformed payload. The cache is
    /// left untouched.
    pub fn handle_push_payload(&self, bytes: &[u8]) -> SyncResult<PushOutcome> {
        match ChangeEvent::<R>::from_json(bytes) {
            Ok(event) => Ok(self.shared.handle_push(event)),
            Err(e) => {
                warn!(table = %self.shared.config.table, error = %e, "discarding malformed push payload");
                let mut stats = self.shared.stats.write();
                stats.malformed_payloads += 1;
                stats.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }
}

impl<R: TableRow, B: RemoteBackend<R>> Drop for TableSync<R, B> {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
