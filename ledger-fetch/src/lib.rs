//! C6 Fetcher: paginated HTTP consumer with explicit success/empty/failure
//! result typing and bounded retry.
//!
//! The single largest source of design in this module, per the
//! specification, is refusing to let a transient failure masquerade as an
//! empty page -- conflating the two silently drops data. [`FetchOutcome`]
//! is therefore a tagged three-way variant, not a nullable-plus-error pair,
//! matching the corpus's explicit-sum-type style.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ledger_model::error::{is_transient_message, is_transient_status};
use serde::Deserialize;
use std::time::Duration;
use tokio_retry2::strategy::{ExponentialBackoff, jitter};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: String,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_cap_ms: u64,
    /// Must be explicitly set to disable TLS verification; never implied
    /// by any other flag.
    pub insecure_tls: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            page_size: 1000,
            request_timeout: Duration::from_secs(120),
            max_retries: 5,
            retry_base_delay_ms: 1_000,
            retry_cap_ms: 30_000,
            insecure_tls: false,
        }
    }
}

/// The result of one HTTP page fetch. Never collapse `SuccessEmpty` and
/// `Failure` -- callers depend on the distinction to decide whether the
/// shard is actually done or merely hit a transient error.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    SuccessData { rows: Vec<serde_json::Value>, next_cursor: Option<String> },
    SuccessEmpty { next_cursor: Option<String> },
    Failure { err: String, retryable: bool },
}

impl FetchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, FetchOutcome::Failure { .. })
    }
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    rows: Vec<serde_json::Value>,
    #[serde(default)]
    next_cursor: Option<String>,
}

pub struct Fetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        if config.insecure_tls {
            warn!("INSECURE_TLS is set: certificate verification is disabled for the ledger API client");
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()?;
        Ok(Self { client, config })
    }

    /// Fetches one historical page, bounded below by `at_or_after` and
    /// above (exclusive) by `before`. Internally retries transient
    /// failures up to `max_retries`; a retry-exhausted transient error or
    /// an immediately-terminal error both surface as `Failure`, never as
    /// `SuccessEmpty`.
    pub async fn fetch_backfill_page(
        &self,
        before: DateTime<Utc>,
        at_or_after: DateTime<Utc>,
    ) -> FetchOutcome {
        self.fetch_page_with_query(
            "updates",
            &[
                ("before", before.to_rfc3339()),
                ("at_or_after", at_or_after.to_rfc3339()),
                ("page_size", self.config.page_size.to_string()),
            ],
        )
        .await
    }

    /// Fetches one page of the live forward stream, resuming from `offset`.
    pub async fn fetch_updates_page(&self, after_offset: i64) -> FetchOutcome {
        self.fetch_page_with_query(
            "updates",
            &[
                ("after_offset", after_offset.to_string()),
                ("page_size", self.config.page_size.to_string()),
            ],
        )
        .await
    }

    /// Fetches one page of the active contract set for `migration_id`,
    /// resuming from the opaque `cursor` the previous page returned (absent
    /// for the first page). `fetch_all` widens the query past whatever
    /// default recency window the ACS endpoint applies on its own -- the
    /// `--fetch-all` CLI flag's only effect (Open Question resolution, see
    /// DESIGN.md).
    pub async fn fetch_acs_page(&self, migration_id: i64, cursor: Option<&str>, fetch_all: bool) -> FetchOutcome {
        let mut query = vec![
            ("migration_id", migration_id.to_string()),
            ("page_size", self.config.page_size.to_string()),
        ];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }
        if fetch_all {
            query.push(("fetch_all", "true".to_string()));
        }
        self.fetch_page_with_query("acs", &query).await
    }

    async fn fetch_page_with_query(&self, endpoint: &str, query: &[(&str, String)]) -> FetchOutcome {
        let strategy = ExponentialBackoff::from_millis(self.config.retry_base_delay_ms.max(1))
            .factor(2)
            .max_delay(Duration::from_millis(self.config.retry_cap_ms))
            .map(jitter)
            .take(self.config.max_retries);

        let result = Retry::spawn(strategy, || self.attempt(endpoint, query)).await;

        match result {
            Ok(page) if page.rows.is_empty() => FetchOutcome::SuccessEmpty { next_cursor: page.next_cursor },
            Ok(page) => FetchOutcome::SuccessData { rows: page.rows, next_cursor: page.next_cursor },
            Err(RetryError::Permanent(msg)) => FetchOutcome::Failure { err: msg, retryable: false },
            Err(RetryError::Transient { err, .. }) => FetchOutcome::Failure { err, retryable: true },
        }
    }

    async fn attempt(&self, endpoint: &str, query: &[(&str, String)]) -> Result<PageResponse, RetryError<String>> {
        let url = format!("{}/{endpoint}", self.config.base_url.trim_end_matches('/'));
        debug!("fetching {url} {query:?}");
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("http {status}: {body}");
            return if is_transient_status(status.as_u16()) {
                Err(RetryError::transient(msg))
            } else {
                Err(RetryError::permanent(msg))
            };
        }

        response
            .json::<PageResponse>()
            .await
            .map_err(|e| RetryError::permanent(format!("decoding response body: {e}")))
    }
}

fn classify_request_error(e: &reqwest::Error) -> RetryError<String> {
    let msg = e.to_string();
    if e.is_timeout() || e.is_connect() || is_transient_message(&msg) {
        RetryError::transient(msg)
    } else {
        RetryError::permanent(msg)
    }
}

/// Drives the "decrease `before` to the earliest returned `record_time`
/// minus 1ms, until `before <= at_or_after` or three consecutive empty
/// pages" backfill pagination heuristic from §4.6. Owns no I/O itself --
/// the shard scheduler (C7) calls [`Fetcher::fetch_backfill_page`] and
/// feeds the outcome back via [`BackfillPager::observe`].
pub struct BackfillPager {
    before: DateTime<Utc>,
    at_or_after: DateTime<Utc>,
    consecutive_empty: u32,
}

impl BackfillPager {
    pub fn new(before: DateTime<Utc>, at_or_after: DateTime<Utc>) -> Self {
        Self { before, at_or_after, consecutive_empty: 0 }
    }

    pub fn before(&self) -> DateTime<Utc> {
        self.before
    }

    pub fn at_or_after(&self) -> DateTime<Utc> {
        self.at_or_after
    }

    /// The pager is exhausted when the window has been fully walked, or
    /// three consecutive pages came back empty (the sparse-region
    /// heuristic: rather than busy-loop forever over a gap with no data,
    /// give up after three tries).
    pub fn exhausted(&self) -> bool {
        self.before <= self.at_or_after || self.consecutive_empty >= 3
    }

    /// Feeds one `fetch_backfill_page` outcome back into the pager's
    /// state. Must be called once per page fetched at the pager's current
    /// `before()`/`at_or_after()` bounds.
    pub fn observe(&mut self, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::SuccessData { rows, .. } => {
                self.consecutive_empty = 0;
                if let Some(earliest) = earliest_record_time(rows) {
                    self.before = earliest - ChronoDuration::milliseconds(1);
                }
            }
            FetchOutcome::SuccessEmpty { .. } => {
                self.consecutive_empty += 1;
            }
            FetchOutcome::Failure { .. } => {}
        }
    }
}

fn earliest_record_time(rows: &[serde_json::Value]) -> Option<DateTime<Utc>> {
    rows.iter()
        .filter_map(|row| row.get("record_time").and_then(|v| v.as_str()))
        .filter_map(|s| ledger_model::normalize::parse_lenient_utc(s).ok())
        .min()
}
