//! In-memory backend.
//!
//! Keeps one table in process, applies prefilters and conditions itself and
//! echoes confirmed writes to push subscribers the way a hosted backend
//! does. Used by the tests and by the CLI's replay command.

use crate::backend::{ChannelSpec, PageWindow, PushChannel, PushSender, RemoteBackend, ScopedQuery};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rowsync_protocol::{ChangeEvent, ChangeKind, KeyMatch, KeySchema, Prefilter, TableRow};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

enum Write<R> {
    Insert(R),
    Upsert(R),
    Delete(KeyMatch),
}

struct Subscriber<R> {
    prefilter: Option<Prefilter>,
    sender: PushSender<R>,
}

struct State<R> {
    rows: Vec<R>,
    windows: Vec<PageWindow>,
    subscribers: Vec<Subscriber<R>>,
    held: VecDeque<oneshot::Sender<bool>>,
    held_fetches: Vec<oneshot::Sender<()>>,
    writes: u64,
    clock: u64,
    echo_writes: bool,
    hold_writes: bool,
    hold_fetches: bool,
    fail_writes: bool,
    fail_count: bool,
    fail_subscribe: bool,
    fail_fetch_at: Option<u64>,
}

/// A single remote table held in memory.
pub struct MemoryBackend<R: TableRow> {
    table: String,
    schema: Arc<KeySchema>,
    state: Mutex<State<R>>,
    held_count: watch::Sender<usize>,
    held_fetch_count: watch::Sender<usize>,
}

impl<R: TableRow> MemoryBackend<R> {
    /// Creates an empty backend serving `table`.
    pub fn new(table: impl Into<String>, schema: KeySchema) -> Self {
        let (held_count, _) = watch::channel(0);
        let (held_fetch_count, _) = watch::channel(0);
        Self {
            table: table.into(),
            schema: Arc::new(schema),
            state: Mutex::new(State {
                rows: Vec::new(),
                windows: Vec::new(),
                subscribers: Vec::new(),
                held: VecDeque::new(),
                held_fetches: Vec::new(),
                writes: 0,
                clock: 0,
                echo_writes: true,
                hold_writes: false,
                hold_fetches: false,
                fail_writes: false,
                fail_count: false,
                fail_subscribe: false,
                fail_fetch_at: None,
            }),
            held_count,
            held_fetch_count,
        }
    }

    /// Appends rows to the store without notifying subscribers.
    pub fn seed(&self, rows: impl IntoIterator<Item = R>) {
        self.state.lock().rows.extend(rows);
    }

    /// Returns the stored rows in order.
    pub fn rows(&self) -> Vec<R> {
        self.state.lock().rows.clone()
    }

    /// Returns every page window requested so far.
    pub fn windows(&self) -> Vec<PageWindow> {
        self.state.lock().windows.clone()
    }

    /// Number of write calls received, including rejected ones.
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Number of open push channels.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.sender.is_closed());
        state.subscribers.len()
    }

    /// Publishes confirmed writes to subscribers. On by default.
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo_writes = echo;
    }

    /// Rejects every write with a transport error.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Makes `count` fail with a transport error.
    pub fn fail_count(&self, fail: bool) {
        self.state.lock().fail_count = fail;
    }

    /// Makes the page starting at `offset` fail.
    pub fn fail_fetch_at(&self, offset: u64) {
        self.state.lock().fail_fetch_at = Some(offset);
    }

    /// Makes `subscribe_channel` fail.
    pub fn fail_subscribe(&self, fail: bool) {
        self.state.lock().fail_subscribe = fail;
    }

    /// Holds writes open until released with [`release_oldest`] or
    /// [`release_newest`].
    ///
    /// [`release_oldest`]: MemoryBackend::release_oldest
    /// [`release_newest`]: MemoryBackend::release_newest
    pub fn hold_writes(&self, hold: bool) {
        self.state.lock().hold_writes = hold;
    }

    /// Waits until at least `n` writes are held.
    pub async fn wait_for_held(&self, n: usize) {
        let mut count = self.held_count.subscribe();
        // The sender lives as long as the backend, so this cannot fail.
        let _ = count.wait_for(|held| *held >= n).await;
    }

    /// Settles the oldest held write. Returns false if none is held.
    pub fn release_oldest(&self, succeed: bool) -> bool {
        let gate = {
            let mut state = self.state.lock();
            let gate = state.held.pop_front();
            self.held_count.send_replace(state.held.len());
            gate
        };
        gate.map_or(false, |g| g.send(succeed).is_ok())
    }

    /// Settles the most recent held write. Returns false if none is held.
    pub fn release_newest(&self, succeed: bool) -> bool {
        let gate = {
            let mut state = self.state.lock();
            let gate = state.held.pop_back();
            self.held_count.send_replace(state.held.len());
            gate
        };
        gate.map_or(false, |g| g.send(succeed).is_ok())
    }

    /// Holds page fetches open until [`release_fetches`] is called. The
    /// page is read from the store after the release.
    ///
    /// [`release_fetches`]: MemoryBackend::release_fetches
    pub fn hold_fetches(&self, hold: bool) {
        self.state.lock().hold_fetches = hold;
    }

    /// Waits until at least `n` page fetches are held.
    pub async fn wait_for_held_fetches(&self, n: usize) {
        let mut count = self.held_fetch_count.subscribe();
        let _ = count.wait_for(|held| *held >= n).await;
    }

    /// Lets every held page fetch proceed. Returns how many were released.
    pub fn release_fetches(&self) -> usize {
        let gates = {
            let mut state = self.state.lock();
            self.held_fetch_count.send_replace(0);
            std::mem::take(&mut state.held_fetches)
        };
        gates.into_iter().filter_map(|g| g.send(()).ok()).count()
    }

    /// Sends `event` to every subscriber whose prefilter admits it.
    ///
    /// Deletes reach every subscriber, since the remote cannot evaluate a
    /// filter against a row that no longer exists.
    pub fn publish(&self, event: ChangeEvent<R>) {
        let mut state = self.state.lock();
        Self::broadcast(&mut state, event);
    }

    /// Drops every push channel.
    pub fn disconnect(&self) {
        self.state.lock().subscribers.clear();
    }

    fn broadcast(state: &mut State<R>, event: ChangeEvent<R>) {
        state.subscribers.retain(|sub| {
            let admitted = !event.kind.is_write()
                || sub.prefilter.as_ref().map_or(true, |p| p.matches(&event.row));
            !admitted || sub.sender.send(event.clone()).is_ok()
        });
    }

    fn check_table(&self, table: &str) -> SyncResult<()> {
        if table == self.table {
            Ok(())
        } else {
            Err(SyncError::transport_fatal(format!("unknown table: {table}")))
        }
    }

    async fn write(&self, table: &str, write: Write<R>) -> SyncResult<()> {
        self.check_table(table)?;

        let gate = {
            let mut state = self.state.lock();
            state.writes += 1;
            if state.fail_writes {
                return Err(SyncError::transport_retryable("write rejected"));
            }
            if state.hold_writes {
                let (tx, rx) = oneshot::channel();
                state.held.push_back(tx);
                self.held_count.send_replace(state.held.len());
                Some(rx)
            } else {
                None
            }
        };

        if let Some(gate) = gate {
            if !gate.await.unwrap_or(false) {
                return Err(SyncError::transport_retryable("write rejected"));
            }
        }

        self.commit(write)
    }

    fn commit(&self, write: Write<R>) -> SyncResult<()> {
        let mut state = self.state.lock();
        let echo = match write {
            Write::Insert(row) => {
                let id = self.schema.identity(&row);
                if state.rows.iter().any(|r| self.schema.identity(r) == id) {
                    return Err(SyncError::transport_fatal(format!("duplicate key {id}")));
                }
                state.rows.push(row.clone());
                Some((ChangeKind::Insert, row))
            }
            Write::Upsert(row) => {
                let id = self.schema.identity(&row);
                match state.rows.iter().position(|r| self.schema.identity(r) == id) {
                    Some(pos) => {
                        state.rows[pos] = row.clone();
                        Some((ChangeKind::Update, row))
                    }
                    None => {
                        state.rows.push(row.clone());
                        Some((ChangeKind::Insert, row))
                    }
                }
            }
            Write::Delete(key) => {
                let pos = state.rows.iter().position(|r| key.matches(r));
                pos.map(|pos| (ChangeKind::Delete, state.rows.remove(pos)))
            }
        };

        if let (true, Some((kind, row))) = (state.echo_writes, echo) {
            state.clock += 1;
            let event = ChangeEvent {
                kind,
                row,
                timestamp: Some(format!("t{:06}", state.clock)),
            };
            Self::broadcast(&mut state, event);
        }
        Ok(())
    }
}

#[async_trait]
impl<R: TableRow> RemoteBackend<R> for MemoryBackend<R> {
    async fn count(&self, query: &ScopedQuery) -> SyncResult<u64> {
        self.check_table(&query.table)?;
        let state = self.state.lock();
        if state.fail_count {
            return Err(SyncError::transport_retryable("count failed"));
        }
        Ok(state.rows.iter().filter(|r| query.matches(*r)).count() as u64)
    }

    async fn fetch_page(&self, query: &ScopedQuery, window: PageWindow) -> SyncResult<Vec<R>> {
        self.check_table(&query.table)?;
        let gate = {
            let mut state = self.state.lock();
            state.windows.push(window);
            if state.fail_fetch_at == Some(window.offset) {
                return Err(SyncError::transport_retryable(format!(
                    "fetch failed at offset {}",
                    window.offset
                )));
            }
            if state.hold_fetches {
                let (tx, rx) = oneshot::channel();
                state.held_fetches.push(tx);
                self.held_fetch_count.send_replace(state.held_fetches.len());
                Some(rx)
            } else {
                None
            }
        };

        if let Some(gate) = gate {
            if gate.await.is_err() {
                return Err(SyncError::transport_retryable("fetch abandoned"));
            }
        }

        let state = self.state.lock();
        Ok(state
            .rows
            .iter()
            .filter(|r| query.matches(*r))
            .skip(window.offset as usize)
            .take(window.limit() as usize)
            .cloned()
            .collect())
    }

    async fn insert(&self, table: &str, row: &R) -> SyncResult<()> {
        self.write(table, Write::Insert(row.clone())).await
    }

    async fn upsert(&self, table: &str, row: &R) -> SyncResult<()> {
        self.write(table, Write::Upsert(row.clone())).await
    }

    async fn delete(&self, table: &str, key: &KeyMatch) -> SyncResult<()> {
        self.write(table, Write::Delete(key.clone())).await
    }

    async fn subscribe_channel(&self, spec: &ChannelSpec) -> SyncResult<PushChannel<R>> {
        self.check_table(&spec.table)?;
        let mut state = self.state.lock();
        if state.fail_subscribe {
            return Err(SyncError::transport_retryable("channel unavailable"));
        }
        let (sender, channel) = PushChannel::pair();
        state.subscribers.push(Subscriber {
            prefilter: spec.prefilter.clone(),
            sender,
        });
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_protocol::{Condition, ConditionSet, Row};

    fn backend() -> MemoryBackend<Row> {
        MemoryBackend::new("tasks", KeySchema::new(["id"]).unwrap())
    }

    fn task(id: i64, list: i64) -> Row {
        Row::new().with("id", id).with("list_id", list)
    }

    fn all() -> ScopedQuery {
        ScopedQuery {
            table: "tasks".into(),
            prefilter: None,
            conditions: ConditionSet::new(),
        }
    }

    #[tokio::test]
    async fn unknown_table_is_rejected() {
        let backend = backend();
        let err = backend.upsert("other", &task(1, 1)).await.unwrap_err();
        assert!(err.is_transport());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn queries_apply_prefilter_and_conditions() {
        let backend = backend();
        backend.seed((1..=6).map(|i| task(i, i % 2)));

        let query = ScopedQuery {
            prefilter: Some(Prefilter::new("list_id", 0)),
            conditions: ConditionSet::new().with(Condition::new(
                "id",
                rowsync_protocol::Operator::Gt,
                2,
            )),
            ..all()
        };
        assert_eq!(backend.count(&query).await.unwrap(), 2);
        let page = backend
            .fetch_page(&query, PageWindow { offset: 1, end: 1 })
            .await
            .unwrap();
        assert_eq!(page, vec![task(6, 0)]);
    }

    #[tokio::test]
    async fn writes_are_echoed_through_prefilter() {
        let backend = backend();
        let spec = ChannelSpec {
            table: "tasks".into(),
            prefilter: Some(Prefilter::new("list_id", 1)),
        };
        let mut channel = backend.subscribe_channel(&spec).await.unwrap();

        backend.upsert("tasks", &task(1, 2)).await.unwrap();
        backend.upsert("tasks", &task(2, 1)).await.unwrap();
        backend
            .delete("tasks", &KeySchema::new(["id"]).unwrap().matcher(&task(1, 2)))
            .await
            .unwrap();

        let first = channel.try_next().unwrap();
        assert_eq!(first.row, task(2, 1));
        assert!(first.is_remote());
        let second = channel.try_next().unwrap();
        assert_eq!(second.kind, ChangeKind::Delete);
        assert!(channel.try_next().is_none());
        assert_eq!(backend.rows(), vec![task(2, 1)]);
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let backend = backend();
        backend.insert("tasks", &task(1, 1)).await.unwrap();
        assert!(backend.insert("tasks", &task(1, 2)).await.is_err());
    }

    #[tokio::test]
    async fn held_writes_settle_on_release() {
        let backend = Arc::new(backend());
        backend.set_echo(false);
        backend.hold_writes(true);

        let writer = Arc::clone(&backend);
        let first = tokio::spawn(async move { writer.upsert("tasks", &task(1, 1)).await });
        backend.wait_for_held(1).await;
        let writer = Arc::clone(&backend);
        let second = tokio::spawn(async move { writer.upsert("tasks", &task(2, 1)).await });
        backend.wait_for_held(2).await;

        assert!(backend.release_newest(false));
        assert!(backend.release_oldest(true));
        assert!(!backend.release_oldest(true));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_err());
        assert_eq!(backend.rows(), vec![task(1, 1)]);
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test]
    async fn held_fetch_reads_the_store_after_release() {
        let backend = Arc::new(backend());
        backend.seed([task(1, 1)]);
        backend.hold_fetches(true);

        let reader = Arc::clone(&backend);
        let fetch = tokio::spawn(async move {
            reader.fetch_page(&all(), PageWindow { offset: 0, end: 9 }).await
        });
        backend.wait_for_held_fetches(1).await;
        backend.seed([task(2, 1)]);

        assert_eq!(backend.release_fetches(), 1);
        assert_eq!(backend.release_fetches(), 0);
        assert_eq!(fetch.await.unwrap().unwrap(), vec![task(1, 1), task(2, 1)]);
        assert_eq!(backend.windows(), vec![PageWindow { offset: 0, end: 9 }]);
    }
}
