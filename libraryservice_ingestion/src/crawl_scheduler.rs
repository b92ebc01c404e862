use std::sync::Arc;

use futures_util::future::join_all;
use serde::Deserialize;

use libraryservice_repository::records_repository::RecordStore;

use crate::catalog_fetcher::{CatalogSource, PageFetch};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Partitions of the query space, crawled one after another
    pub keywords: Vec<String>,
    pub page_size: u64,
    /// Maximum number of pages in flight at any time
    pub concurrency_limit: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            keywords: (0..10).map(|digit| digit.to_string()).collect(),
            page_size: 20,
            concurrency_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SkipReason {
    /// Count query failed, message of the failure
    CountFailed(String),
    Empty,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct KeywordReport {
    pub keyword: String,
    pub total_count: u64,
    pub total_pages: u64,
    pub pages_processed: u64,
    pub pages_abandoned: u64,
    pub pages_store_failed: u64,
    pub records_stored: u64,
    pub skipped: Option<SkipReason>,
}

#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub keywords: Vec<KeywordReport>,
}

impl CrawlReport {
    pub fn records_stored(&self) -> u64 {
        self.keywords.iter().map(|k| k.records_stored).sum()
    }

    pub fn pages_failed(&self) -> u64 {
        self.keywords
            .iter()
            .map(|k| k.pages_abandoned + k.pages_store_failed)
            .sum()
    }
}

enum PageOutcome {
    Stored(usize),
    Abandoned,
    StoreFailed,
}

/// Drives a full crawl: keywords sequentially, pages of a keyword in
/// batches of `concurrency_limit`, every batch awaited as a whole before the next starts.
pub struct CrawlScheduler {
    source: Arc<dyn CatalogSource>,
    store: Arc<dyn RecordStore>,
    config: CrawlConfig,
}

impl CrawlScheduler {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        store: Arc<dyn RecordStore>,
        config: CrawlConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    pub async fn run(&self) -> CrawlReport {
        tracing::info!(
            concurrency_limit = self.config.concurrency_limit,
            page_size = self.config.page_size,
            "Starting catalog crawl over {} keywords",
            self.config.keywords.len()
        );
        let mut report = CrawlReport::default();
        for keyword in self.config.keywords.iter() {
            report.keywords.push(self.crawl_keyword(keyword).await);
        }
        tracing::info!(
            records_stored = report.records_stored(),
            pages_failed = report.pages_failed(),
            "Catalog crawl finished"
        );
        report
    }

    #[tracing::instrument(skip(self))]
    async fn crawl_keyword(&self, keyword: &str) -> KeywordReport {
        let mut report = KeywordReport {
            keyword: keyword.to_string(),
            ..KeywordReport::default()
        };

        report.total_count = match self.source.fetch_count(keyword).await {
            Ok(0) => {
                tracing::info!("No records for keyword, skipping");
                report.skipped = Some(SkipReason::Empty);
                return report;
            }
            Ok(total_count) => total_count,
            Err(err) => {
                tracing::error!("Count query failed, skipping keyword: {}", err);
                report.skipped = Some(SkipReason::CountFailed(err.to_string()));
                return report;
            }
        };

        let page_size = self.config.page_size.max(1);
        let concurrency_limit = self.config.concurrency_limit.max(1) as u64;
        report.total_pages = report.total_count.div_ceil(page_size);
        tracing::info!(
            total_count = report.total_count,
            total_pages = report.total_pages,
            "Crawling keyword"
        );

        let stride = page_size * concurrency_limit;
        let mut stride_start = 0;
        while stride_start < report.total_count {
            let batch: Vec<_> = (0..concurrency_limit)
                .map(|page_in_stride| stride_start + page_in_stride * page_size)
                .take_while(|offset| *offset < report.total_count)
                .map(|offset| self.ingest_page(keyword, offset, page_size))
                .collect();

            for outcome in join_all(batch).await {
                report.pages_processed += 1;
                match outcome {
                    PageOutcome::Stored(records) => report.records_stored += records as u64,
                    PageOutcome::Abandoned => report.pages_abandoned += 1,
                    PageOutcome::StoreFailed => report.pages_store_failed += 1,
                }
            }

            tracing::info!(
                pages_processed = report.pages_processed,
                total_pages = report.total_pages,
                percent = report.pages_processed * 100 / report.total_pages,
                "Crawl progress"
            );
            stride_start += stride;
        }
        report
    }

    async fn ingest_page(&self, keyword: &str, offset: u64, page_size: u64) -> PageOutcome {
        let records = match self.source.fetch_page(keyword, offset, page_size).await {
            PageFetch::Fetched(records) => records,
            PageFetch::Abandoned {
                attempts,
                last_error,
            } => {
                tracing::warn!(
                    offset,
                    attempts,
                    "Skipping page of keyword {}: {}",
                    keyword,
                    last_error
                );
                return PageOutcome::Abandoned;
            }
        };
        if records.is_empty() {
            return PageOutcome::Stored(0);
        }
        match self.store.upsert_records(&records).await {
            Ok(written) => PageOutcome::Stored(written),
            Err(err) => {
                tracing::error!(offset, "Failed to store page of keyword {}: {}", keyword, err);
                PageOutcome::StoreFailed
            }
        }
    }
}
