//! Catalog lookup contract, the YouTube Data API implementation, and the batched enricher.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use ymw_core::CatalogMetadata;
use ymw_fetch::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "ymw-catalog";

/// Documented id limit of `videos.list`.
pub const YOUTUBE_MAX_BATCH: usize = 50;
pub const YOUTUBE_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

const QUOTA_REASONS: &[&str] = &[
    "quotaExceeded",
    "dailyLimitExceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
];
const CREDENTIAL_REASONS: &[&str] = &[
    "keyInvalid",
    "keyExpired",
    "forbidden",
    "accessNotConfigured",
    "ipRefererBlocked",
    "authError",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Resolved(CatalogMetadata),
    /// Explicit absence marker: deleted, private, or unusable metadata.
    Unresolved { item_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("catalog rejected the access credential: {reason}")]
    CredentialRejected { reason: String },
    #[error("catalog quota exhausted: {reason}")]
    QuotaExceeded { reason: String },
    #[error("catalog batch failed: {0}")]
    Transient(String),
}

impl LookupError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CredentialRejected { .. } | Self::QuotaExceeded { .. })
    }
}

/// External metadata service. Implementations hold their own credential.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    fn max_batch_size(&self) -> usize;

    /// Resolve up to `max_batch_size` ids. Ids missing from the result count as unresolved.
    async fn lookup_batch(&self, ids: &[String]) -> Result<Vec<LookupOutcome>, LookupError>;
}

#[derive(Clone)]
pub struct YouTubeCatalogConfig {
    pub base_url: String,
    pub api_key: String,
}

impl fmt::Debug for YouTubeCatalogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YouTubeCatalogConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// `videos.list` client over the shared rate-limited fetcher.
#[derive(Debug)]
pub struct YouTubeCatalog {
    http: Arc<HttpFetcher>,
    config: YouTubeCatalogConfig,
    run_id: Uuid,
}

impl YouTubeCatalog {
    pub fn new(http: Arc<HttpFetcher>, config: YouTubeCatalogConfig, run_id: Uuid) -> Self {
        Self { http, config, run_id }
    }

    fn videos_url(&self, ids: &[String]) -> String {
        format!(
            "{}/videos?part=contentDetails,snippet&id={}&key={}",
            self.config.base_url.trim_end_matches('/'),
            ids.join(","),
            self.config.api_key
        )
    }
}

#[async_trait]
impl CatalogLookup for YouTubeCatalog {
    fn max_batch_size(&self) -> usize {
        YOUTUBE_MAX_BATCH
    }

    async fn lookup_batch(&self, ids: &[String]) -> Result<Vec<LookupOutcome>, LookupError> {
        let url = self.videos_url(ids);
        match self.http.fetch_bytes(self.run_id, "youtube-videos", &url).await {
            Ok(resp) => parse_videos_response(&resp.body, ids),
            Err(FetchError::HttpStatus { status, body, .. }) => Err(classify_api_error(status, &body)),
            Err(err) => Err(LookupError::Transient(err.to_string())),
        }
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// Map a `videos.list` body onto one outcome per requested id.
pub fn parse_videos_response(body: &[u8], requested: &[String]) -> Result<Vec<LookupOutcome>, LookupError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| LookupError::Transient(format!("invalid catalog response: {e}")))?;
    let items = value
        .get("items")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut outcomes = BTreeMap::new();
    for item in &items {
        let Some(id) = json_str(item, &["id"]) else {
            continue;
        };
        let title = json_str(item, &["snippet", "title"]);
        let channel = json_str(item, &["snippet", "channelTitle"]);
        let duration = json_str(item, &["contentDetails", "duration"]);
        let outcome = match (title, channel, duration.map(parse_iso8601_duration)) {
            (Some(title), Some(channel), Some(Some(seconds))) => {
                LookupOutcome::Resolved(CatalogMetadata {
                    item_id: id.to_string(),
                    title: title.to_string(),
                    artist_channel: channel.to_string(),
                    raw_duration_seconds: seconds,
                })
            }
            (_, _, Some(None)) => LookupOutcome::Unresolved {
                item_id: id.to_string(),
                reason: format!("unparseable duration {}", duration.unwrap_or_default()),
            },
            _ => LookupOutcome::Unresolved {
                item_id: id.to_string(),
                reason: "incomplete metadata".to_string(),
            },
        };
        outcomes.insert(id.to_string(), outcome);
    }

    Ok(requested
        .iter()
        .map(|id| {
            outcomes.remove(id).unwrap_or_else(|| LookupOutcome::Unresolved {
                item_id: id.clone(),
                reason: "not returned by catalog (deleted or private)".to_string(),
            })
        })
        .collect())
}

/// Classify a non-success API response by status and `error.errors[].reason`.
pub fn classify_api_error(status: u16, body: &str) -> LookupError {
    let value: JsonValue = serde_json::from_str(body).unwrap_or(JsonValue::Null);
    let message = json_str(&value, &["error", "message"]).unwrap_or_default().to_string();
    let reasons = value
        .get("error")
        .and_then(|e| e.get("errors"))
        .and_then(|e| e.as_array())
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| json_str(e, &["reason"]).map(ToString::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let detail = if message.is_empty() {
        format!("http status {status}")
    } else {
        format!("http status {status}: {message}")
    };

    let has_reason = |known: &[&str]| reasons.iter().any(|r| known.contains(&r.as_str()));
    if has_reason(QUOTA_REASONS) || status == 429 {
        LookupError::QuotaExceeded { reason: detail }
    } else if has_reason(CREDENTIAL_REASONS)
        || status == 401
        || status == 403
        || (status == 400 && message.to_ascii_lowercase().contains("api key"))
    {
        LookupError::CredentialRejected { reason: detail }
    } else {
        LookupError::Transient(detail)
    }
}

/// ISO-8601 duration (`PT4M13S`, `P1DT2H`, `P0D`) to whole seconds.
pub fn parse_iso8601_duration(text: &str) -> Option<u32> {
    let rest = text.trim().strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };
    if date_part.is_empty() && time_part.map_or(true, str::is_empty) {
        return None;
    }
    let mut total = sum_duration_components(date_part, &[('W', 604_800), ('D', 86_400)])?;
    if let Some(time) = time_part {
        if time.is_empty() {
            return None;
        }
        total = total.checked_add(sum_duration_components(time, &[('H', 3_600), ('M', 60), ('S', 1)])?)?;
    }
    u32::try_from(total).ok()
}

/// Sum `<number><unit>` components; units must appear in the given order.
fn sum_duration_components(part: &str, units: &[(char, u64)]) -> Option<u64> {
    let mut total = 0u64;
    let mut number = String::new();
    let mut next_unit = 0;
    for ch in part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
            continue;
        }
        let offset = units[next_unit..].iter().position(|(unit, _)| *unit == ch)?;
        let (_, scale) = units[next_unit + offset];
        let value: f64 = number.parse().ok()?;
        total = total.checked_add((value * scale as f64) as u64)?;
        number.clear();
        next_unit += offset + 1;
    }
    number.is_empty().then_some(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnrichProgress {
    pub processed: usize,
    pub total: usize,
}

/// Stage-fatal enrichment failure. Already-resolved metadata stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrichError {
    #[error("catalog rejected the access credential: {reason}")]
    CredentialRejected { reason: String },
    #[error("catalog quota exhausted: {reason}")]
    QuotaExceeded { reason: String },
}

impl EnrichError {
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::CredentialRejected { .. } => {
                "check the API key and that the YouTube Data API v3 is enabled for its project"
            }
            Self::QuotaExceeded { .. } => {
                "the daily quota is exhausted; retry after it resets or use another project's key"
            }
        }
    }
}

impl TryFrom<LookupError> for EnrichError {
    type Error = LookupError;

    fn try_from(err: LookupError) -> Result<Self, Self::Error> {
        match err {
            LookupError::CredentialRejected { reason } => Ok(Self::CredentialRejected { reason }),
            LookupError::QuotaExceeded { reason } => Ok(Self::QuotaExceeded { reason }),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentReport {
    pub metadata: BTreeMap<String, CatalogMetadata>,
    /// Looked up but not resolvable, with the reason.
    pub unresolved: BTreeMap<String, String>,
    /// Never resolved because enrichment stopped (cancellation or a fatal error).
    pub skipped: BTreeSet<String>,
    pub lookup_calls: usize,
    pub cancelled: bool,
    pub fatal: Option<EnrichError>,
}

struct BatchResult {
    batch: Vec<String>,
    outcome: Option<Result<Vec<LookupOutcome>, LookupError>>,
}

/// Resolves distinct item ids through a [`CatalogLookup`], batched and optionally concurrent.
pub struct Enricher {
    lookup: Arc<dyn CatalogLookup>,
    concurrency: usize,
    progress: watch::Sender<EnrichProgress>,
}

impl Enricher {
    pub fn new(lookup: Arc<dyn CatalogLookup>) -> Self {
        let (progress, _) = watch::channel(EnrichProgress::default());
        Self {
            lookup,
            concurrency: 1,
            progress,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Observe `(processed, total)` as batches complete.
    pub fn subscribe(&self) -> watch::Receiver<EnrichProgress> {
        self.progress.subscribe()
    }

    pub async fn enrich(&self, ids: &BTreeSet<String>, cancel: &CancellationToken) -> EnrichmentReport {
        let ids = ids.iter().cloned().collect::<Vec<_>>();
        let total = ids.len();
        let batch_size = self.lookup.max_batch_size().max(1);
        let stop = cancel.child_token();
        self.progress.send_replace(EnrichProgress { processed: 0, total });

        let lookup = &self.lookup;
        let mut results = stream::iter(ids.chunks(batch_size).map(<[String]>::to_vec).enumerate())
            .map(|(index, batch)| {
                let stop = stop.clone();
                async move {
                    if stop.is_cancelled() {
                        return BatchResult { batch, outcome: None };
                    }
                    let span = info_span!("catalog_batch", index, size = batch.len());
                    let outcome = lookup.lookup_batch(&batch).instrument(span).await;
                    BatchResult {
                        batch,
                        outcome: Some(outcome),
                    }
                }
            })
            .buffer_unordered(self.concurrency);

        let mut report = EnrichmentReport::default();
        let mut processed = 0;
        while let Some(BatchResult { batch, outcome }) = results.next().await {
            let size = batch.len();
            match outcome {
                None => report.skipped.extend(batch),
                Some(Ok(outcomes)) => {
                    report.lookup_calls += 1;
                    absorb_outcomes(&mut report, batch, outcomes);
                }
                Some(Err(err)) => {
                    report.lookup_calls += 1;
                    match EnrichError::try_from(err) {
                        Ok(fatal) => {
                            warn!(error = %fatal, "stopping catalog enrichment");
                            stop.cancel();
                            report.skipped.extend(batch);
                            report.fatal.get_or_insert(fatal);
                        }
                        Err(err) => {
                            warn!(error = %err, size, "catalog batch failed; ids left unresolved");
                            for id in batch {
                                report.unresolved.insert(id, err.to_string());
                            }
                        }
                    }
                }
            }
            processed += size;
            self.progress.send_replace(EnrichProgress { processed, total });
            debug!(processed, total, "catalog enrichment progress");
        }

        report.cancelled = cancel.is_cancelled();
        info!(
            resolved = report.metadata.len(),
            unresolved = report.unresolved.len(),
            skipped = report.skipped.len(),
            lookup_calls = report.lookup_calls,
            cancelled = report.cancelled,
            "catalog enrichment finished"
        );
        report
    }
}

fn absorb_outcomes(report: &mut EnrichmentReport, batch: Vec<String>, outcomes: Vec<LookupOutcome>) {
    let mut pending = batch.into_iter().collect::<BTreeSet<_>>();
    for outcome in outcomes {
        match outcome {
            LookupOutcome::Resolved(meta) => {
                if pending.remove(&meta.item_id) {
                    report.metadata.insert(meta.item_id.clone(), meta);
                }
            }
            LookupOutcome::Unresolved { item_id, reason } => {
                if pending.remove(&item_id) {
                    report.unresolved.insert(item_id, reason);
                }
            }
        }
    }
    for id in pending {
        report
            .unresolved
            .insert(id, "missing from catalog response".to_string());
    }
}

/// Lookup over a fixed metadata table, for offline runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: BTreeMap<String, CatalogMetadata>,
    batch_size: usize,
    fail_after: Option<(usize, LookupError)>,
    calls: std::sync::Mutex<Vec<Vec<String>>>,
}

impl InMemoryCatalog {
    pub fn new(entries: impl IntoIterator<Item = CatalogMetadata>) -> Self {
        Self {
            entries: entries.into_iter().map(|m| (m.item_id.clone(), m)).collect(),
            batch_size: YOUTUBE_MAX_BATCH,
            fail_after: None,
            calls: Default::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Answer the first `calls` batches normally, then fail every later one with `err`.
    pub fn failing_after(mut self, calls: usize, err: LookupError) -> Self {
        self.fail_after = Some((calls, err));
        self
    }

    /// Batches received so far, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CatalogLookup for InMemoryCatalog {
    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn lookup_batch(&self, ids: &[String]) -> Result<Vec<LookupOutcome>, LookupError> {
        let call_index = match self.calls.lock() {
            Ok(mut calls) => {
                calls.push(ids.to_vec());
                calls.len() - 1
            }
            Err(_) => return Err(LookupError::Transient("catalog state poisoned".into())),
        };
        if let Some((allowed, err)) = &self.fail_after {
            if call_index >= *allowed {
                return Err(err.clone());
            }
        }
        Ok(ids
            .iter()
            .map(|id| match self.entries.get(id) {
                Some(meta) => LookupOutcome::Resolved(meta.clone()),
                None => LookupOutcome::Unresolved {
                    item_id: id.clone(),
                    reason: "unknown id".to_string(),
                },
            })
            .collect())
    }
}
