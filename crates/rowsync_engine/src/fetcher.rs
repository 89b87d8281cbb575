//! Paginated initial load.

use crate::backend::{PageWindow, RemoteBackend, ScopedQuery};
use rowsync_protocol::TableRow;
use serde::Serialize;
use tracing::{debug, warn};

/// Summary of an initial load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Row count reported by the remote.
    pub total: u64,
    /// Rows received across all pages.
    pub fetched: u64,
    /// Pages requested.
    pub pages: u64,
    /// Loading stopped on an error; the rows fetched so far were kept.
    pub aborted: bool,
}

/// Fetches every row of a scoped query in fixed-size windows.
#[derive(Debug, Clone, Copy)]
pub struct PageFetcher {
    page_size: u64,
}

impl PageFetcher {
    /// Creates a fetcher. A zero page size is treated as one.
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }

    /// Returns the page size.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Returns the window starting at `offset` for a result of `count` rows,
    /// or `None` once `offset` is past the last row.
    pub fn window(&self, offset: u64, count: u64) -> Option<PageWindow> {
        if offset >= count {
            return None;
        }
        let end = offset.saturating_add(self.page_size).min(count).checked_sub(1)?;
        Some(PageWindow { offset, end })
    }

    /// Counts the rows of `query`, then feeds every row to `sink` page by page.
    ///
    /// Errors are logged and end the load early. Nothing is retried.
    pub async fn load<R, B, F>(&self, backend: &B, query: &ScopedQuery, mut sink: F) -> LoadReport
    where
        R: TableRow,
        B: RemoteBackend<R> + ?Sized,
        F: FnMut(R),
    {
        let mut report = LoadReport::default();

        let count = match backend.count(query).await {
            Ok(count) => count,
            Err(e) => {
                warn!(table = %query.table, error = %e, "count failed, skipping initial load");
                report.aborted = true;
                return report;
            }
        };
        report.total = count;
        debug!(table = %query.table, count, page_size = self.page_size, "starting initial load");

        let mut offset = 0;
        while let Some(window) = self.window(offset, count) {
            report.pages += 1;

            let rows = match backend.fetch_page(query, window).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(table = %query.table, offset, error = %e, "page fetch failed, stopping load");
                    report.aborted = true;
                    break;
                }
            };

            let received = rows.len() as u64;
            report.fetched += received;
            for row in rows {
                sink(row);
            }

            if received < window.limit() {
                debug!(table = %query.table, offset, received, "short page, remote shrank during load");
                break;
            }
            offset = window.end + 1;
        }

        report
    }
}

impl Default for PageFetcher {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use rowsync_protocol::{ConditionSet, KeySchema, Row};

    fn backend(rows: i64) -> MemoryBackend<Row> {
        let backend = MemoryBackend::new("items", KeySchema::new(["id"]).unwrap());
        backend.seed((0..rows).map(|i| Row::new().with("id", i)));
        backend
    }

    fn query() -> ScopedQuery {
        ScopedQuery {
            table: "items".into(),
            prefilter: None,
            conditions: ConditionSet::new(),
        }
    }

    #[test]
    fn windows_are_inclusive_and_clamped() {
        let fetcher = PageFetcher::new(1000);
        assert_eq!(fetcher.window(0, 2500), Some(PageWindow { offset: 0, end: 999 }));
        assert_eq!(
            fetcher.window(2000, 2500),
            Some(PageWindow { offset: 2000, end: 2499 })
        );
        assert_eq!(PageFetcher::new(0).page_size(), 1);
    }

    #[test]
    fn no_window_past_the_last_row() {
        let fetcher = PageFetcher::new(10);
        assert_eq!(fetcher.window(0, 0), None);
        assert_eq!(fetcher.window(5, 5), None);
        assert_eq!(fetcher.window(u64::MAX, 3), None);
        assert_eq!(fetcher.window(4, 5), Some(PageWindow { offset: 4, end: 4 }));
        assert_eq!(
            PageFetcher::new(u64::MAX).window(1, u64::MAX),
            Some(PageWindow { offset: 1, end: u64::MAX - 1 })
        );
    }

    #[tokio::test]
    async fn loads_every_page() {
        let backend = backend(25);
        let mut seen = Vec::new();
        let report = PageFetcher::new(10)
            .load(&backend, &query(), |row: Row| seen.push(row))
            .await;

        assert_eq!(
            report,
            LoadReport {
                total: 25,
                fetched: 25,
                pages: 3,
                aborted: false
            }
        );
        assert_eq!(seen.len(), 25);
        assert_eq!(
            backend.windows(),
            vec![
                PageWindow { offset: 0, end: 9 },
                PageWindow { offset: 10, end: 19 },
                PageWindow { offset: 20, end: 24 },
            ]
        );
    }

    #[tokio::test]
    async fn empty_table_issues_no_fetch() {
        let backend = backend(0);
        let report = PageFetcher::new(10).load(&backend, &query(), |_: Row| {}).await;
        assert_eq!(report.pages, 0);
        assert!(!report.aborted);
        assert!(backend.windows().is_empty());
    }

    #[tokio::test]
    async fn fetch_error_keeps_partial_data() {
        let backend = backend(30);
        backend.fail_fetch_at(10);

        let mut seen = 0;
        let report = PageFetcher::new(10).load(&backend, &query(), |_: Row| seen += 1).await;

        assert!(report.aborted);
        assert_eq!(seen, 10);
        assert_eq!(report.pages, 2);
    }

    #[tokio::test]
    async fn count_error_aborts_before_fetching() {
        let backend = backend(5);
        backend.fail_count(true);

        let report = PageFetcher::new(10).load(&backend, &query(), |_: Row| {}).await;
        assert!(report.aborted);
        assert_eq!(report.total, 0);
        assert!(backend.windows().is_empty());
    }
}
