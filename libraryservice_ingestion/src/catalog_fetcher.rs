//! Client for the remote catalog search endpoint.
//!
//! Pages that keep failing are abandoned after a bounded number of retries and
//! reported through [`PageFetch::Abandoned`] instead of an error, so a single bad
//! page never stops a crawl.

use std::time::Duration;

use anyhow::Context;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;
use serde::Deserialize;

use libraryservice_repository::api::CatalogRecordDetails;

pub const DEFAULT_CATALOG_URL: &str = "https://pyxis.knu.ac.kr/pyxis-api/1/collections/1/search";
/// Value of the `code` field of a successful search response
pub const SUCCESS_CODE: &str = "success.retrieved";
pub const MISSING_CALL_NUMBER: &str = "no call number";
pub const MISSING_LOCATION: &str = "library";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogFetcherConfig {
    /// Full url of the search endpoint
    pub base_url: String,
    /// Appended to the keyword in the `all` parameter, selects record type and search field
    pub query_qualifiers: String,
    pub request_timeout_ms: u64,
    /// Retries after the first failed attempt of a page
    pub max_retries: u32,
    /// Retry n waits n times this step
    pub retry_backoff_step_ms: u64,
}

impl Default for CatalogFetcherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CATALOG_URL.to_string(),
            query_qualifiers: "k|a|0".to_string(),
            request_timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_step_ms: 1_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Catalog request failed: {0}")]
    Transport(#[from] reqwest_middleware::Error),

    #[error("Catalog answered with HTTP status {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("Catalog answered with code {0}")]
    Protocol(String),

    #[error("Failed to read catalog response: {0}")]
    Body(#[from] reqwest::Error),
}

/// Result of fetching one page
#[derive(Debug)]
pub enum PageFetch {
    Fetched(Vec<CatalogRecordDetails>),
    Abandoned { attempts: u32, last_error: FetchError },
}

impl PageFetch {
    /// Records of the page, empty for an abandoned page
    pub fn into_records(self) -> Vec<CatalogRecordDetails> {
        match self {
            PageFetch::Fetched(records) => records,
            PageFetch::Abandoned { .. } => vec![],
        }
    }
}

/// Source of catalog pages consumed by the crawl scheduler
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    /// Total number of records matching the keyword
    async fn fetch_count(&self, keyword: &str) -> Result<u64, FetchError>;

    /// One page of normalized records starting at `offset`
    async fn fetch_page(&self, keyword: &str, offset: u64, page_size: u64) -> PageFetch;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    code: String,
    #[serde(default)]
    data: Option<SearchData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    list: Option<Vec<RawCatalogRecord>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCatalogRecord {
    #[serde(default)]
    id: serde_json::Value,
    title_statement: Option<String>,
    thumbnail_url: Option<String>,
    author: Option<String>,
    publication: Option<String>,
    branch_volumes: Option<Vec<RawBranchVolume>>,
}

#[derive(Debug, Deserialize)]
struct RawBranchVolume {
    volume: Option<String>,
    name: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Maps a raw record to the stored shape, None when it carries no usable id
fn normalize_record(raw: RawCatalogRecord) -> Option<CatalogRecordDetails> {
    let id = match raw.id {
        serde_json::Value::String(id) if !id.is_empty() => id,
        serde_json::Value::Number(id) => id.to_string(),
        _ => return None,
    };
    let first_volume = raw
        .branch_volumes
        .and_then(|volumes| volumes.into_iter().next());
    let (call_number, location) = match first_volume {
        Some(volume) => (non_empty(volume.volume), non_empty(volume.name)),
        None => (None, None),
    };
    Some(CatalogRecordDetails {
        id,
        title: raw.title_statement.unwrap_or_default(),
        img_url: non_empty(raw.thumbnail_url),
        author: raw.author.unwrap_or_default(),
        publisher: raw.publication.unwrap_or_default(),
        call_number: call_number.unwrap_or_else(|| MISSING_CALL_NUMBER.to_string()),
        location: location.unwrap_or_else(|| MISSING_LOCATION.to_string()),
    })
}

pub struct CatalogFetcher {
    config: CatalogFetcherConfig,
    client: ClientWithMiddleware,
}

impl CatalogFetcher {
    pub fn new(config: CatalogFetcherConfig) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build reqwest client")?;
        let client = ClientBuilder::new(reqwest_client)
            .with(TracingMiddleware::default())
            .build();

        Ok(Self { config, client })
    }

    /// Calls the search endpoint once
    async fn search(&self, keyword: &str, offset: u64, max: u64) -> Result<SearchData, FetchError> {
        let response = self
            .client
            .get(&self.config.base_url)
            .query(&[
                ("all", format!("{}|{}", keyword, self.config.query_qualifiers)),
                ("facet", "false".to_string()),
                ("max", max.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status()));
        }

        let body: SearchResponse = response.json().await?;
        if body.code != SUCCESS_CODE {
            return Err(FetchError::Protocol(body.code));
        }
        Ok(body.data.unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl CatalogSource for CatalogFetcher {
    #[tracing::instrument(skip(self))]
    async fn fetch_count(&self, keyword: &str) -> Result<u64, FetchError> {
        Ok(self.search(keyword, 0, 1).await?.total_count)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_page(&self, keyword: &str, offset: u64, page_size: u64) -> PageFetch {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self.search(keyword, offset, page_size).await {
                Ok(data) => {
                    let records: Vec<_> = data
                        .list
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(normalize_record)
                        .collect();
                    return PageFetch::Fetched(records);
                }
                Err(err) if attempt < max_attempts => {
                    let backoff = Duration::from_millis(self.config.retry_backoff_step_ms) * attempt;
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Catalog page request failed, retrying: {}",
                        err
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(
                        attempts = attempt,
                        "Catalog page abandoned after retries: {}",
                        err
                    );
                    return PageFetch::Abandoned {
                        attempts: attempt,
                        last_error: err,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod catalog_fetcher_tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn fetcher_for(server: &MockServer) -> CatalogFetcher {
        CatalogFetcher::new(CatalogFetcherConfig {
            base_url: format!("{}/search", server.uri()),
            request_timeout_ms: 200,
            retry_backoff_step_ms: 1,
            ..CatalogFetcherConfig::default()
        })
        .expect("Failed to create fetcher")
    }

    fn page_body() -> serde_json::Value {
        json!({
            "code": "success.retrieved",
            "data": {
                "totalCount": 2,
                "list": [
                    {
                        "id": 1234,
                        "titleStatement": "Rust in Action",
                        "thumbnailUrl": "http://img/1234.jpg",
                        "author": "McNamara",
                        "publication": "Manning, 2021",
                        "branchVolumes": [
                            { "volume": "005.133 M478r", "name": "Main library" },
                            { "volume": "other", "name": "Branch" }
                        ]
                    },
                    {
                        "id": "B-9",
                        "titleStatement": "Untitled notes",
                        "thumbnailUrl": "",
                        "branchVolumes": []
                    },
                    {
                        "titleStatement": "No id at all"
                    }
                ]
            }
        })
    }

    #[tokio::test]
    /// Sends the expected query and maps raw records, filling sentinels for missing fields
    async fn test_fetch_page_normalizes_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("all", "7|k|a|0"))
            .and(query_param("facet", "false"))
            .and(query_param("max", "20"))
            .and(query_param("offset", "40"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body()))
            .expect(1)
            .mount(&server)
            .await;

        let records = match fetcher_for(&server).fetch_page("7", 40, 20).await {
            PageFetch::Fetched(records) => records,
            other => panic!("Unexpected page result {:?}", other),
        };

        assert_eq!(
            records,
            vec![
                CatalogRecordDetails {
                    id: "1234".to_string(),
                    title: "Rust in Action".to_string(),
                    img_url: Some("http://img/1234.jpg".to_string()),
                    author: "McNamara".to_string(),
                    publisher: "Manning, 2021".to_string(),
                    call_number: "005.133 M478r".to_string(),
                    location: "Main library".to_string(),
                },
                CatalogRecordDetails {
                    id: "B-9".to_string(),
                    title: "Untitled notes".to_string(),
                    img_url: None,
                    author: "".to_string(),
                    publisher: "".to_string(),
                    call_number: MISSING_CALL_NUMBER.to_string(),
                    location: MISSING_LOCATION.to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_page_with_empty_result_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "success.retrieved",
                "data": { "totalCount": 0, "list": null }
            })))
            .mount(&server)
            .await;

        let page = fetcher_for(&server).fetch_page("1", 0, 20).await;
        assert!(matches!(page, PageFetch::Fetched(ref records) if records.is_empty()));
    }

    #[tokio::test]
    /// Two server errors followed by a success, page still arrives
    async fn test_fetch_page_retries_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body()))
            .with_priority(2)
            .expect(1)
            .mount(&server)
            .await;

        let records = fetcher_for(&server).fetch_page("1", 0, 20).await.into_records();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    /// Protocol failures are retried like network ones, the page is abandoned after
    /// the first attempt plus three retries
    async fn test_fetch_page_abandons_after_exhausting_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "error.internal",
                "data": null
            })))
            .expect(4)
            .mount(&server)
            .await;

        let page = fetcher_for(&server).fetch_page("1", 0, 20).await;
        match page {
            PageFetch::Abandoned {
                attempts,
                last_error: FetchError::Protocol(code),
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(code, "error.internal");
            }
            other => panic!("Unexpected page result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_page_times_out_and_is_abandoned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page_body())
                    .set_delay(Duration::from_millis(1_000)),
            )
            .mount(&server)
            .await;

        let fetcher = CatalogFetcher::new(CatalogFetcherConfig {
            base_url: format!("{}/search", server.uri()),
            request_timeout_ms: 50,
            max_retries: 1,
            retry_backoff_step_ms: 1,
            ..CatalogFetcherConfig::default()
        })
        .unwrap();

        let page = fetcher.fetch_page("1", 0, 20).await;
        assert!(matches!(page, PageFetch::Abandoned { attempts: 2, .. }));
        assert!(page.into_records().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("all", "3|k|a|0"))
            .and(query_param("max", "1"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "success.retrieved",
                "data": { "totalCount": 4321, "list": [] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(fetcher_for(&server).fetch_count("3").await.unwrap(), 4321);
    }

    #[tokio::test]
    /// Count failures are not retried
    async fn test_fetch_count_failure_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        assert!(matches!(
            fetcher_for(&server).fetch_count("3").await,
            Err(FetchError::HttpStatus(status)) if status.as_u16() == 500
        ));
    }
}
