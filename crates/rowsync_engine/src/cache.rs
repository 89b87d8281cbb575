//! Ordered in-memory row cache with snapshot subscribers.
//!
//! The cache keeps rows in arrival order. Re-upserting a known identity
//! replaces the row in place; only new identities are appended.
//!
//! Every mutation is followed, before the mutating call returns, by a
//! notification carrying an immutable snapshot of all rows. A reentrant
//! gate serialises "mutate, snapshot, notify", so each subscriber sees
//! every snapshot exactly once and in the order the mutations were applied.
//! Callbacks may read the cache. A callback that mutates it applies the
//! change at once, but its snapshot is queued and delivered only after the
//! current snapshot has reached every listener.

use parking_lot::{ReentrantMutex, RwLock};
use rowsync_protocol::{KeySchema, RowId, TableRow};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// An immutable view of every cached row, oldest first.
pub type Snapshot<R> = Arc<[R]>;

type Listener<R> = Arc<dyn Fn(&Snapshot<R>) + Send + Sync>;
type Listeners<R> = RwLock<Vec<(u64, Listener<R>)>>;

struct Entries<R> {
    by_seq: BTreeMap<u64, R>,
    seq_of: HashMap<RowId, u64>,
    next_seq: u64,
}

impl<R: Clone> Entries<R> {
    fn new() -> Self {
        Self {
            by_seq: BTreeMap::new(),
            seq_of: HashMap::new(),
            next_seq: 0,
        }
    }

    fn snapshot(&self) -> Snapshot<R> {
        self.by_seq.values().cloned().collect()
    }
}

/// Snapshots waiting for delivery, owned by whoever holds the gate.
struct Delivery<R> {
    running: bool,
    queue: VecDeque<Snapshot<R>>,
}

/// Clears `running` even if a listener panics.
struct Running<'a, R>(&'a RefCell<Delivery<R>>);

impl<R> Drop for Running<'_, R> {
    fn drop(&mut self) {
        let mut delivery = self.0.borrow_mut();
        delivery.running = false;
        delivery.queue.clear();
    }
}

/// Ordered identity → row map with a reactive read surface.
pub struct RowCache<R: TableRow> {
    schema: Arc<KeySchema>,
    entries: RwLock<Entries<R>>,
    listeners: Arc<Listeners<R>>,
    next_listener: AtomicU64,
    gate: ReentrantMutex<RefCell<Delivery<R>>>,
}

impl<R: TableRow> RowCache<R> {
    /// Creates an empty cache keyed by `schema`.
    pub fn new(schema: Arc<KeySchema>) -> Self {
        Self {
            schema,
            entries: RwLock::new(Entries::new()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            gate: ReentrantMutex::new(RefCell::new(Delivery {
                running: false,
                queue: VecDeque::new(),
            })),
        }
    }

    /// Returns the key schema rows are identified by.
    pub fn schema(&self) -> &Arc<KeySchema> {
        &self.schema
    }

    /// Derives the identity of `row`.
    pub fn identity_of(&self, row: &R) -> RowId {
        self.schema.identity(row)
    }

    /// Inserts `row`, or replaces the cached row with the same identity
    /// without moving it.
    pub fn upsert(&self, row: R) -> RowId {
        let id = self.identity_of(&row);
        self.mutate(|entries| {
            match entries.seq_of.get(&id) {
                Some(seq) => {
                    entries.by_seq.insert(*seq, row);
                }
                None => {
                    let seq = entries.next_seq;
                    entries.next_seq += 1;
                    entries.seq_of.insert(id.clone(), seq);
                    entries.by_seq.insert(seq, row);
                }
            }
            true
        });
        id
    }

    /// Removes the row with identity `id`.
    ///
    /// Returns the removed row. Deleting an absent identity is a no-op and
    /// notifies nobody.
    pub fn delete(&self, id: &RowId) -> Option<R> {
        let mut removed = None;
        self.mutate(|entries| {
            let Some(seq) = entries.seq_of.remove(id) else {
                return false;
            };
            removed = entries.by_seq.remove(&seq);
            true
        });
        removed
    }

    /// Removes the cached row with the same identity as `row`.
    pub fn delete_row(&self, row: &R) -> Option<R> {
        self.delete(&self.identity_of(row))
    }

    /// Removes every row.
    pub fn clear(&self) {
        self.mutate(|entries| {
            if entries.seq_of.is_empty() {
                return false;
            }
            entries.seq_of.clear();
            entries.by_seq.clear();
            true
        });
    }

    /// Gets a row by identity.
    pub fn get(&self, id: &RowId) -> Option<R> {
        let entries = self.entries.read();
        let seq = entries.seq_of.get(id)?;
        entries.by_seq.get(seq).cloned()
    }

    /// Returns the oldest surviving row.
    pub fn get_first(&self) -> Option<R> {
        self.entries.read().by_seq.values().next().cloned()
    }

    /// Returns true if a row with identity `id` is cached.
    pub fn contains(&self, id: &RowId) -> bool {
        self.entries.read().seq_of.contains_key(id)
    }

    /// Returns the number of cached rows.
    pub fn len(&self) -> usize {
        self.entries.read().seq_of.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current rows, oldest first.
    pub fn snapshot(&self) -> Snapshot<R> {
        self.entries.read().snapshot()
    }

    /// Registers `callback` to receive a snapshot after every mutation.
    ///
    /// The listener stays registered until the returned handle is dropped
    /// or [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot<R>) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(callback)));
        let registry: Weak<Listeners<R>> = Arc::downgrade(&self.listeners);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(listeners) = registry.upgrade() {
                    listeners.write().retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Returns the number of registered listeners.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn mutate(&self, apply: impl FnOnce(&mut Entries<R>) -> bool) {
        let gate = self.gate.lock();
        let snapshot = {
            let mut entries = self.entries.write();
            if !apply(&mut entries) {
                return;
            }
            entries.snapshot()
        };

        {
            let mut delivery = gate.borrow_mut();
            delivery.queue.push_back(snapshot);
            if delivery.running {
                // Called from a listener; the outer loop delivers it.
                return;
            }
            delivery.running = true;
        }

        let _running = Running(&*gate);
        loop {
            let next = gate.borrow_mut().queue.pop_front();
            let Some(snapshot) = next else { break };
            self.notify(&snapshot);
        }
    }

    fn notify(&self, snapshot: &Snapshot<R>) {
        // Listeners are called outside the registry lock so they can
        // subscribe or unsubscribe.
        let listeners: Vec<Listener<R>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

/// Handle returned by [`RowCache::subscribe`].
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the listener.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}
