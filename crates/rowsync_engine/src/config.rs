//! Configuration for a mirrored table.

use crate::backend::{ChannelSpec, ScopedQuery};
use rowsync_protocol::{Condition, ConditionSet, KeySchema, Prefilter};
use std::sync::Arc;

/// Default number of rows requested per page during the initial load.
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

/// Configuration for one mirrored table.
///
/// Built once before the table is created and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Remote table name.
    pub table: String,
    /// Primary-key columns, shared with the table's cache.
    pub key_schema: Arc<KeySchema>,
    /// Apply writes locally before the remote confirms them.
    pub optimistic: bool,
    /// Single-column equality the remote enforces.
    pub prefilter: Option<Prefilter>,
    /// Relevance conditions, re-checked for every push event.
    pub conditions: ConditionSet,
    /// Rows per page during the initial load.
    pub page_size: u64,
}

impl TableConfig {
    /// Creates a configuration for `table` keyed by `key_schema`.
    pub fn new(table: impl Into<String>, key_schema: KeySchema) -> Self {
        Self {
            table: table.into(),
            key_schema: Arc::new(key_schema),
            optimistic: false,
            prefilter: None,
            conditions: ConditionSet::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Enables or disables optimistic writes.
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    /// Sets the remote prefilter.
    pub fn with_prefilter(mut self, prefilter: Prefilter) -> Self {
        self.prefilter = Some(prefilter);
        self
    }

    /// Adds a relevance condition.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Replaces the relevance conditions.
    pub fn with_conditions(mut self, conditions: ConditionSet) -> Self {
        self.conditions = conditions;
        self
    }

    /// Sets the page size. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The query that scopes the initial load.
    pub fn scoped_query(&self) -> ScopedQuery {
        ScopedQuery {
            table: self.table.clone(),
            prefilter: self.prefilter.clone(),
            conditions: self.conditions.clone(),
        }
    }

    /// The push channel subscription for this table.
    pub fn channel_spec(&self) -> ChannelSpec {
        ChannelSpec {
            table: self.table.clone(),
            prefilter: self.prefilter.clone(),
        }
    }
}
