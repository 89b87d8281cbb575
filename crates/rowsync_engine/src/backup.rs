//! Pre-mutation snapshots for optimistic writes.
//!
//! Every optimistic attempt on a row takes a [`BackupTicket`] before the
//! speculative value is applied to the cache. The ticket is released once
//! the remote call settles, and the log answers how the cache has to be
//! corrected.
//!
//! Overlapping attempts on one identity stack as layers of a single entry.
//! The entry's refcount is its number of layers and the entry disappears
//! when the last layer is released. Each layer remembers the row as it was
//! when that attempt started, so a failure can restore the right state:
//!
//! - A failed attempt that is the newest in flight restores its own
//!   pre-attempt row.
//! - A failed attempt with a newer one still in flight hands its
//!   pre-attempt row down to the next newer layer and leaves the cache on
//!   the newer speculative value.
//!
//! A failed attempt that is the newest in flight restores its pre-attempt
//! row even when an overlapping newer attempt has already been confirmed.
//! The confirmed value is then on the remote but not in the mirror, and
//! its echo was suppressed while the older attempt was in flight. The
//! mirror stays on the restored row until the next remote event for that
//! identity or the next load; this divergence is accepted.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use rowsync_protocol::RowId;
use std::collections::HashMap;

/// How a remote call settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The remote accepted the write.
    Confirmed,
    /// The remote rejected the write or could not be reached.
    Failed,
}

impl Settlement {
    /// Maps a remote call result to a settlement.
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Settlement::Confirmed
        } else {
            Settlement::Failed
        }
    }
}

/// Correction the cache needs after a release.
#[derive(Debug, Clone, PartialEq)]
pub enum Rollback<R> {
    /// Leave the cached row as it is.
    Keep,
    /// Put this row back.
    Restore(R),
    /// The row did not exist before; remove it.
    Remove,
}

/// Handle for one in-flight attempt.
///
/// Deliberately not `Clone`: each ticket is released exactly once.
#[derive(Debug)]
pub struct BackupTicket {
    id: RowId,
    layer: u64,
}

impl BackupTicket {
    /// Identity of the row this ticket protects.
    pub fn id(&self) -> &RowId {
        &self.id
    }
}

#[derive(Debug)]
struct Layer<R> {
    layer: u64,
    before: Option<R>,
}

struct Inner<R> {
    entries: HashMap<RowId, Vec<Layer<R>>>,
    next_layer: u64,
}

/// Reference-counted backups of rows with optimistic writes in flight.
pub struct PessimisticWriteLog<R> {
    inner: Mutex<Inner<R>>,
}

impl<R: Clone> PessimisticWriteLog<R> {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_layer: 0,
            }),
        }
    }

    /// Records the pre-attempt state of `id`.
    ///
    /// `before` is the cached row (or `None` if the row is not mirrored).
    /// Creates the entry on the first attempt and adds a layer for each
    /// overlapping one.
    pub fn backup(&self, id: &RowId, before: Option<R>) -> BackupTicket {
        let mut inner = self.inner.lock();
        let layer = inner.next_layer;
        inner.next_layer += 1;
        inner
            .entries
            .entry(id.clone())
            .or_default()
            .push(Layer { layer, before });
        BackupTicket {
            id: id.clone(),
            layer,
        }
    }

    /// Releases `ticket` and returns the correction the cache needs.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::BackupInvariant`] if the log holds no entry
    /// (or no such layer) for the ticket's identity.
    pub fn release(&self, ticket: BackupTicket, settlement: Settlement) -> SyncResult<Rollback<R>> {
        let mut inner = self.inner.lock();
        let invariant = || SyncError::BackupInvariant {
            id: ticket.id.clone(),
        };

        let layers = inner.entries.get_mut(&ticket.id).ok_or_else(invariant)?;
        let pos = layers
            .iter()
            .position(|l| l.layer == ticket.layer)
            .ok_or_else(invariant)?;
        let released = layers.remove(pos);
        let newest = pos == layers.len();

        let rollback = match settlement {
            Settlement::Confirmed => Rollback::Keep,
            Settlement::Failed if newest => match released.before {
                Some(row) => Rollback::Restore(row),
                None => Rollback::Remove,
            },
            Settlement::Failed => {
                // The next newer attempt now started from this one's base.
                layers[pos].before = released.before;
                Rollback::Keep
            }
        };

        if layers.is_empty() {
            inner.entries.remove(&ticket.id);
        }
        Ok(rollback)
    }

    /// Returns true if `id` has an attempt in flight.
    pub fn has(&self, id: &RowId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Number of attempts in flight for `id`.
    pub fn refcount(&self, id: &RowId) -> usize {
        self.inner.lock().entries.get(id).map_or(0, Vec::len)
    }

    /// Number of identities with attempts in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Clone> Default for PessimisticWriteLog<R> {
    fn default() -> Self {
        Self::new()
    }
}
