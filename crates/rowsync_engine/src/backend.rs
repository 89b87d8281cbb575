//! Remote backend abstraction.

use crate::error::SyncResult;
use async_trait::async_trait;
use rowsync_protocol::{ChangeEvent, ConditionSet, KeyMatch, Prefilter, TableRow};
use tokio::sync::mpsc;

/// The remote side of a mirrored table.
///
/// This trait abstracts the query and transport layer, allowing for
/// different implementations (a hosted Postgres API, a websocket gateway,
/// the in-memory backend used in tests, etc.).
#[async_trait]
pub trait RemoteBackend<R: TableRow>: Send + Sync {
    /// Counts the rows selected by `query`.
    async fn count(&self, query: &ScopedQuery) -> SyncResult<u64>;

    /// Fetches the rows of `query` at positions `window.offset..=window.end`.
    async fn fetch_page(&self, query: &ScopedQuery, window: PageWindow) -> SyncResult<Vec<R>>;

    /// Inserts a new row.
    async fn insert(&self, table: &str, row: &R) -> SyncResult<()>;

    /// Inserts or replaces a row by primary key.
    async fn upsert(&self, table: &str, row: &R) -> SyncResult<()>;

    /// Deletes the row selected by `key`.
    async fn delete(&self, table: &str, key: &KeyMatch) -> SyncResult<()>;

    /// Opens the push channel for a table.
    async fn subscribe_channel(&self, spec: &ChannelSpec) -> SyncResult<PushChannel<R>>;
}

/// A fetch scoped by the table's prefilter and condition set.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedQuery {
    /// Table name.
    pub table: String,
    /// Optional single-column equality.
    pub prefilter: Option<Prefilter>,
    /// Conjunctive conditions.
    pub conditions: ConditionSet,
}

impl ScopedQuery {
    /// Returns true if `row` is selected by this query.
    pub fn matches<R: TableRow>(&self, row: &R) -> bool {
        self.prefilter.as_ref().map_or(true, |p| p.matches(row)) && self.conditions.matches(row)
    }
}

/// An inclusive window of row positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    /// First position.
    pub offset: u64,
    /// Last position, inclusive.
    pub end: u64,
}

impl PageWindow {
    /// Number of rows the window spans.
    pub fn limit(&self) -> u64 {
        self.end - self.offset + 1
    }
}

/// What a push channel subscription listens to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    /// Table name.
    pub table: String,
    /// Optional single-column equality enforced remotely.
    pub prefilter: Option<Prefilter>,
}

/// Receiving end of a push channel.
///
/// Dropping the channel ends the subscription.
pub struct PushChannel<R> {
    receiver: mpsc::UnboundedReceiver<ChangeEvent<R>>,
}

/// Sending end of a push channel, held by the backend.
pub type PushSender<R> = mpsc::UnboundedSender<ChangeEvent<R>>;

impl<R> PushChannel<R> {
    /// Creates a connected sender/channel pair.
    pub fn pair() -> (PushSender<R>, Self) {
        let (tx, receiver) = mpsc::unbounded_channel();
        (tx, Self { receiver })
    }

    /// Waits for the next event. Returns `None` once the backend hangs up.
    pub async fn next(&mut self) -> Option<ChangeEvent<R>> {
        self.receiver.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_next(&mut self) -> Option<ChangeEvent<R>> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_protocol::{Condition, Operator, Row};

    #[test]
    fn window_limit_is_inclusive() {
        assert_eq!(PageWindow { offset: 0, end: 999 }.limit(), 1000);
        assert_eq!(PageWindow { offset: 2000, end: 2499 }.limit(), 500);
        assert_eq!(PageWindow { offset: 5, end: 5 }.limit(), 1);
    }

    #[test]
    fn scoped_query_applies_prefilter_and_conditions() {
        let query = ScopedQuery {
            table: "tasks".into(),
            prefilter: Some(Prefilter::new("list_id", 1)),
            conditions: ConditionSet::new().with(Condition::new("priority", Operator::Gt, 2)),
        };

        assert!(query.matches(&Row::new().with("list_id", 1).with("priority", 3)));
        assert!(!query.matches(&Row::new().with("list_id", 2).with("priority", 3)));
        assert!(!query.matches(&Row::new().with("list_id", 1).with("priority", 1)));
    }

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (tx, mut channel) = PushChannel::<Row>::pair();
        tx.send(ChangeEvent::insert(Row::new().with("id", 1))).unwrap();
        tx.send(ChangeEvent::delete(Row::new().with("id", 1))).unwrap();
        drop(tx);

        assert!(channel.next().await.unwrap().kind.is_write());
        assert!(!channel.next().await.unwrap().kind.is_write());
        assert!(channel.next().await.is_none());
    }
}
