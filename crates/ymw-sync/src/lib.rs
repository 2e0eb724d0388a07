//! Wrapped pipeline: dedup, duration normalization, aggregation, audit, and run reports.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use ymw_archive::{parse_archive, Classifier, MonthAliases};
use ymw_catalog::{
    CatalogLookup, EnrichError, EnrichProgress, Enricher, YouTubeCatalog, YouTubeCatalogConfig,
    YOUTUBE_API_BASE_URL,
};
use ymw_core::{
    AggregateRow, CandidateRecord, CatalogMetadata, ClassifiedListen, DiagnosticRow, EntityKind,
    Granularity, NormalizedListen, PeriodKey, PeriodScope, DURATION_CAP_SECONDS,
};
use ymw_fetch::{HttpClientConfig, HttpFetcher, TokenBucketConfig};

pub const CRATE_NAME: &str = "ymw-sync";

/// Shorter catalog entries are treated as clips, not songs.
pub const DEFAULT_MIN_DURATION_SECONDS: u32 = 60;
pub const DEFAULT_TOP_N: usize = 10;

#[derive(Clone)]
pub struct WrapConfig {
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub lookup_concurrency: usize,
    /// Catalog requests per minute; `None` leaves lookups unpaced.
    pub lookup_rate_per_minute: Option<u32>,
    pub min_duration_seconds: u32,
    pub month_aliases_path: Option<PathBuf>,
    pub web_port: u16,
}

impl Default for WrapConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: YOUTUBE_API_BASE_URL.to_string(),
            reports_dir: PathBuf::from("./reports"),
            user_agent: "ymw/0.1".to_string(),
            http_timeout_secs: 20,
            lookup_concurrency: 4,
            lookup_rate_per_minute: None,
            min_duration_seconds: DEFAULT_MIN_DURATION_SECONDS,
            month_aliases_path: None,
            web_port: 8000,
        }
    }
}

impl fmt::Debug for WrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base_url", &self.api_base_url)
            .field("reports_dir", &self.reports_dir)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("lookup_concurrency", &self.lookup_concurrency)
            .field("lookup_rate_per_minute", &self.lookup_rate_per_minute)
            .field("min_duration_seconds", &self.min_duration_seconds)
            .field("month_aliases_path", &self.month_aliases_path)
            .field("web_port", &self.web_port)
            .finish()
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl WrapConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("YOUTUBE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            api_base_url: std::env::var("YMW_API_BASE_URL").unwrap_or(defaults.api_base_url),
            reports_dir: std::env::var("YMW_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            user_agent: std::env::var("YMW_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("YMW_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            lookup_concurrency: env_parse("YMW_LOOKUP_CONCURRENCY")
                .unwrap_or(defaults.lookup_concurrency),
            lookup_rate_per_minute: env_parse("YMW_LOOKUP_RATE").filter(|rate| *rate > 0),
            min_duration_seconds: env_parse("YMW_MIN_DURATION_SECS")
                .unwrap_or(defaults.min_duration_seconds),
            month_aliases_path: std::env::var("YMW_MONTH_ALIASES").ok().map(PathBuf::from),
            web_port: env_parse("YMW_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    /// Classifier with the built-in month table plus any configured YAML aliases.
    pub fn classifier(&self) -> Result<Classifier> {
        let aliases = match &self.month_aliases_path {
            Some(path) => MonthAliases::load_yaml(path)?,
            None => MonthAliases::default(),
        };
        Classifier::new(aliases).context("building event classifier")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            per_endpoint_concurrency: self.lookup_concurrency.max(1),
            token_bucket: self.lookup_rate_per_minute.and_then(|rate| {
                let burst = u32::try_from(self.lookup_concurrency).unwrap_or(u32::MAX);
                TokenBucketConfig::per_minute(rate, burst)
            }),
            ..Default::default()
        }
    }
}

/// Distinct non-empty item ids among music listens.
pub fn distinct_music_ids(listens: &[ClassifiedListen]) -> BTreeSet<String> {
    listens
        .iter()
        .filter(|l| l.is_music && !l.item_id().is_empty())
        .map(|l| l.item_id().to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeStats {
    pub music_listens: usize,
    pub empty_id: usize,
    pub missing_metadata: usize,
    pub below_minimum: usize,
    pub normalized: usize,
}

impl NormalizeStats {
    pub fn with_metadata(&self) -> usize {
        self.music_listens
            .saturating_sub(self.empty_id)
            .saturating_sub(self.missing_metadata)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DurationNormalizer {
    pub min_duration_seconds: u32,
}

impl Default for DurationNormalizer {
    fn default() -> Self {
        Self {
            min_duration_seconds: DEFAULT_MIN_DURATION_SECONDS,
        }
    }
}

impl DurationNormalizer {
    pub fn cap(raw_duration_seconds: u32) -> u32 {
        raw_duration_seconds.min(DURATION_CAP_SECONDS)
    }

    /// Join music listens with their metadata. Listens that cannot be joined are counted, not kept.
    pub fn normalize(
        &self,
        listens: &[ClassifiedListen],
        metadata: &BTreeMap<String, CatalogMetadata>,
    ) -> (Vec<NormalizedListen>, NormalizeStats) {
        let mut stats = NormalizeStats::default();
        let mut out = Vec::new();
        for listen in listens.iter().filter(|l| l.is_music) {
            stats.music_listens += 1;
            if listen.item_id().is_empty() {
                stats.empty_id += 1;
                continue;
            }
            let Some(meta) = metadata.get(listen.item_id()) else {
                stats.missing_metadata += 1;
                continue;
            };
            if meta.raw_duration_seconds < self.min_duration_seconds {
                stats.below_minimum += 1;
                continue;
            }
            out.push(NormalizedListen {
                listen: listen.clone(),
                metadata: meta.clone(),
                capped_duration_seconds: Self::cap(meta.raw_duration_seconds),
            });
        }
        stats.normalized = out.len();
        (out, stats)
    }
}

/// Ranking order: score desc, plays desc, name asc, key asc.
fn compare_rows(a: &AggregateRow, b: &AggregateRow) -> Ordering {
    b.listen_score
        .total_cmp(&a.listen_score)
        .then_with(|| b.play_count.cmp(&a.play_count))
        .then_with(|| a.entity_name.cmp(&b.entity_name))
        .then_with(|| a.entity_key.cmp(&b.entity_key))
}

struct Tally {
    name: String,
    artist: Option<String>,
    plays: u32,
    seconds: u64,
}

pub fn rank_entities(listens: &[NormalizedListen], scope: PeriodScope, entity: EntityKind) -> Vec<AggregateRow> {
    let mut tallies: HashMap<&str, Tally> = HashMap::new();
    for listen in listens.iter().filter(|l| scope.contains(l.timestamp())) {
        let meta = &listen.metadata;
        let (key, name, artist) = match entity {
            EntityKind::Song => (meta.item_id.as_str(), meta.title.as_str(), Some(meta.artist_channel.as_str())),
            EntityKind::Artist => (meta.artist_channel.as_str(), meta.artist_channel.as_str(), None),
        };
        let tally = tallies.entry(key).or_insert_with(|| Tally {
            name: name.to_string(),
            artist: artist.map(str::to_string),
            plays: 0,
            seconds: 0,
        });
        tally.plays += 1;
        tally.seconds += u64::from(listen.capped_duration_seconds);
    }

    let mut rows = tallies
        .into_iter()
        .map(|(key, tally)| {
            let minutes = tally.seconds as f64 / 60.0;
            AggregateRow {
                entity,
                entity_key: key.to_string(),
                entity_name: tally.name,
                artist_channel: tally.artist,
                scope,
                play_count: tally.plays,
                total_capped_minutes: minutes,
                listen_score: f64::from(tally.plays) * minutes,
            }
        })
        .collect::<Vec<_>>();
    rows.sort_by(compare_rows);
    rows
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rankings {
    pub scope: PeriodScope,
    pub songs: Vec<AggregateRow>,
    pub artists: Vec<AggregateRow>,
}

impl Rankings {
    pub fn truncated(mut self, limit: usize) -> Self {
        self.songs.truncate(limit);
        self.artists.truncate(limit);
        self
    }
}

pub fn aggregate(listens: &[NormalizedListen], scope: PeriodScope) -> Rankings {
    Rankings {
        scope,
        songs: rank_entities(listens, scope, EntityKind::Song),
        artists: rank_entities(listens, scope, EntityKind::Artist),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Night,
    Morning,
    Afternoon,
    Evening,
}

impl TimeOfDay {
    pub const ALL: [Self; 4] = [Self::Night, Self::Morning, Self::Afternoon, Self::Evening];

    pub fn for_hour(hour: u32) -> Self {
        match hour {
            0..=5 => Self::Night,
            6..=11 => Self::Morning,
            12..=17 => Self::Afternoon,
            _ => Self::Evening,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Night => "Night (0-6)",
            Self::Morning => "Morning (6-12)",
            Self::Afternoon => "Afternoon (12-18)",
            Self::Evening => "Evening (18-24)",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeOfDayMinutes {
    pub bucket: TimeOfDay,
    pub label: String,
    pub minutes: f64,
}

/// Dashboard headline figures for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub scope: PeriodScope,
    pub label: String,
    pub listen_count: usize,
    pub total_minutes: f64,
    /// `None` for the overall scope.
    pub growth_text: Option<String>,
    pub minutes_by_day: BTreeMap<NaiveDate, f64>,
    pub minutes_by_time_of_day: Vec<TimeOfDayMinutes>,
    pub favourite_song: Option<AggregateRow>,
    pub favourite_artist: Option<AggregateRow>,
    pub top_songs: Vec<AggregateRow>,
    pub top_artists: Vec<AggregateRow>,
}

fn scoped_seconds(listens: &[NormalizedListen], scope: PeriodScope) -> u64 {
    listens
        .iter()
        .filter(|l| scope.contains(l.timestamp()))
        .map(|l| u64::from(l.capped_duration_seconds))
        .sum()
}

fn growth_text(listens: &[NormalizedListen], key: PeriodKey, current_seconds: u64) -> String {
    let previous = key.previous();
    let previous_seconds = scoped_seconds(listens, PeriodScope::Period(previous));
    if previous_seconds == 0 {
        return "First period of data".to_string();
    }
    let growth = (current_seconds as f64 - previous_seconds as f64) / previous_seconds as f64 * 100.0;
    format!("{growth:+.1}% vs {}", previous.comparison_name())
}

/// `None` when no listen falls in the scope.
pub fn summarize(listens: &[NormalizedListen], scope: PeriodScope, top_n: usize) -> Option<PeriodSummary> {
    let in_scope = listens
        .iter()
        .filter(|l| scope.contains(l.timestamp()))
        .collect::<Vec<_>>();
    if in_scope.is_empty() {
        return None;
    }

    let seconds = in_scope
        .iter()
        .map(|l| u64::from(l.capped_duration_seconds))
        .sum::<u64>();
    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut by_bucket = [0u64; 4];
    for listen in &in_scope {
        let Some(ts) = listen.timestamp() else {
            continue;
        };
        *by_day.entry(ts.date()).or_default() += listen.capped_minutes();
        by_bucket[TimeOfDay::for_hour(ts.hour()) as usize] += u64::from(listen.capped_duration_seconds);
    }

    let rankings = aggregate(listens, scope).truncated(top_n);
    Some(PeriodSummary {
        scope,
        label: scope.label(),
        listen_count: in_scope.len(),
        total_minutes: seconds as f64 / 60.0,
        growth_text: scope.period().map(|key| growth_text(listens, key, seconds)),
        minutes_by_day: by_day,
        minutes_by_time_of_day: TimeOfDay::ALL
            .iter()
            .map(|bucket| TimeOfDayMinutes {
                bucket: *bucket,
                label: bucket.label().to_string(),
                minutes: by_bucket[*bucket as usize] as f64 / 60.0,
            })
            .collect(),
        favourite_song: rankings.songs.first().cloned(),
        favourite_artist: rankings.artists.first().cloned(),
        top_songs: rankings.songs,
        top_artists: rankings.artists,
    })
}

/// Selectable period keys, newest first, including periods with no listens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableScopes {
    pub months: Vec<PeriodKey>,
    pub weeks: Vec<PeriodKey>,
}

impl AvailableScopes {
    pub fn keys(&self, granularity: Granularity) -> &[PeriodKey] {
        match granularity {
            Granularity::Month => &self.months,
            Granularity::Week => &self.weeks,
        }
    }
}

/// Every key from `first` to `last` inclusive, newest first.
fn period_range(first: PeriodKey, last: PeriodKey) -> Vec<PeriodKey> {
    let mut key = first;
    let mut keys = vec![key];
    while key < last {
        key = key.next();
        keys.push(key);
    }
    keys.reverse();
    keys
}

pub fn available_scopes(listens: &[NormalizedListen]) -> AvailableScopes {
    let timestamps = listens.iter().filter_map(NormalizedListen::timestamp);
    let (Some(first), Some(last)) = (timestamps.clone().min(), timestamps.max()) else {
        return AvailableScopes::default();
    };
    let range = |granularity| {
        period_range(
            PeriodKey::for_timestamp(granularity, first),
            PeriodKey::for_timestamp(granularity, last),
        )
    };
    AvailableScopes {
        months: range(Granularity::Month),
        weeks: range(Granularity::Week),
    }
}

/// Raw per-period entry counts, independent of classification and lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub granularity: Granularity,
    pub total_records: u64,
    pub unparsed_timestamps: u64,
    pub rows: Vec<DiagnosticRow>,
}

pub struct DiagnosticAuditor<'a> {
    classifier: &'a Classifier,
}

impl<'a> DiagnosticAuditor<'a> {
    pub fn new(classifier: &'a Classifier) -> Self {
        Self { classifier }
    }

    pub fn audit(&self, records: &[CandidateRecord], granularity: Granularity) -> AuditReport {
        let mut counts: BTreeMap<PeriodKey, u64> = BTreeMap::new();
        let mut unparsed = 0;
        for record in records {
            match self.classifier.parse_timestamp(&record.raw_timestamp_text) {
                Some(ts) => *counts.entry(PeriodKey::for_timestamp(granularity, ts)).or_default() += 1,
                None => unparsed += 1,
            }
        }
        AuditReport {
            granularity,
            total_records: records.len() as u64,
            unparsed_timestamps: unparsed,
            rows: counts
                .into_iter()
                .map(|(period, raw_entry_count)| DiagnosticRow { period, raw_entry_count })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscrepancyRow {
    pub period: PeriodKey,
    pub raw_entries: u64,
    pub aggregated_listens: u64,
}

/// Raw entries next to listens that survived to aggregation, per period.
pub fn discrepancies(audit: &AuditReport, listens: &[NormalizedListen]) -> Vec<DiscrepancyRow> {
    let mut periods: BTreeMap<PeriodKey, (u64, u64)> = audit
        .rows
        .iter()
        .map(|row| (row.period, (row.raw_entry_count, 0)))
        .collect();
    for ts in listens.iter().filter_map(NormalizedListen::timestamp) {
        periods
            .entry(PeriodKey::for_timestamp(audit.granularity, ts))
            .or_default()
            .1 += 1;
    }
    periods
        .into_iter()
        .map(|(period, (raw_entries, aggregated_listens))| DiscrepancyRow {
            period,
            raw_entries,
            aggregated_listens,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineFunnel {
    pub raw_entries: usize,
    pub music_listens: usize,
    pub listens_with_metadata: usize,
    pub qualified_listens: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub distinct_ids: usize,
    pub resolved: usize,
    pub unresolved: BTreeMap<String, String>,
    pub skipped: usize,
    pub lookup_calls: usize,
    pub cancelled: bool,
    pub fatal: Option<EnrichError>,
}

/// Everything one analysis run produced, queryable for any scope.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSnapshot {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub archive_sha256: String,
    pub malformed_records: usize,
    pub funnel: PipelineFunnel,
    pub normalize: NormalizeStats,
    pub enrichment: EnrichmentSummary,
    pub month_audit: AuditReport,
    pub week_audit: AuditReport,
    #[serde(skip)]
    pub listens: Vec<NormalizedListen>,
}

impl AnalysisSnapshot {
    pub fn rankings(&self, scope: PeriodScope) -> Rankings {
        aggregate(&self.listens, scope)
    }

    pub fn summary(&self, scope: PeriodScope, top_n: usize) -> Option<PeriodSummary> {
        summarize(&self.listens, scope, top_n)
    }

    pub fn available_scopes(&self) -> AvailableScopes {
        available_scopes(&self.listens)
    }

    pub fn audit(&self, granularity: Granularity) -> &AuditReport {
        match granularity {
            Granularity::Month => &self.month_audit,
            Granularity::Week => &self.week_audit,
        }
    }

    pub fn discrepancies(&self, granularity: Granularity) -> Vec<DiscrepancyRow> {
        discrepancies(self.audit(granularity), &self.listens)
    }
}

/// Parse and classify counts, without any catalog traffic.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveOverview {
    pub records: usize,
    pub malformed: usize,
    pub music_listens: usize,
    pub distinct_music_ids: usize,
    pub unparsed_timestamps: usize,
    pub month_audit: AuditReport,
}

pub fn inspect_archive(markup: &str, classifier: &Classifier) -> Result<ArchiveOverview> {
    let parsed = parse_archive(markup).context("parsing watch-history archive")?;
    let classified = classifier.classify_all(&parsed.records);
    Ok(ArchiveOverview {
        records: parsed.records.len(),
        malformed: parsed.malformed,
        music_listens: classified.iter().filter(|l| l.is_music).count(),
        distinct_music_ids: distinct_music_ids(&classified).len(),
        unparsed_timestamps: classified.iter().filter(|l| l.parsed_timestamp.is_none()).count(),
        month_audit: DiagnosticAuditor::new(classifier).audit(&parsed.records, Granularity::Month),
    })
}

/// Read an archive from disk. Invalid UTF-8 is replaced rather than rejected, so one corrupt
/// byte only damages the entry it sits in. Returns the markup and the fingerprint of the raw bytes.
pub async fn read_archive(path: &Path) -> Result<(String, String)> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading archive {}", path.display()))?;
    let markup = String::from_utf8_lossy(&bytes).into_owned();
    Ok((markup, archive_fingerprint(&bytes)))
}

pub async fn inspect_file(path: &Path, classifier: &Classifier) -> Result<ArchiveOverview> {
    let (markup, _) = read_archive(path).await?;
    inspect_archive(&markup, classifier)
}

pub fn archive_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct WrapPipeline {
    run_id: Uuid,
    config: WrapConfig,
    classifier: Classifier,
    enricher: Enricher,
}

impl WrapPipeline {
    pub fn new(config: WrapConfig, lookup: Arc<dyn CatalogLookup>, run_id: Uuid) -> Result<Self> {
        let classifier = config.classifier()?;
        let enricher = Enricher::new(lookup).with_concurrency(config.lookup_concurrency);
        Ok(Self {
            run_id,
            config,
            classifier,
            enricher,
        })
    }

    /// Pipeline backed by the YouTube Data API; requires an API key.
    pub fn with_youtube_catalog(config: WrapConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("YOUTUBE_API_KEY is not set (export it or pass --api-key)")?;
        let run_id = Uuid::new_v4();
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let catalog = YouTubeCatalog::new(
            http,
            YouTubeCatalogConfig {
                base_url: config.api_base_url.clone(),
                api_key,
            },
            run_id,
        );
        Self::new(config, Arc::new(catalog), run_id)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &WrapConfig {
        &self.config
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<EnrichProgress> {
        self.enricher.subscribe()
    }

    pub async fn analyze_file(&self, path: &Path, cancel: &CancellationToken) -> Result<AnalysisSnapshot> {
        let (markup, archive_sha256) = read_archive(path).await?;
        self.run(&markup, archive_sha256, cancel).await
    }

    pub async fn analyze_markup(&self, markup: &str, cancel: &CancellationToken) -> Result<AnalysisSnapshot> {
        self.run(markup, archive_fingerprint(markup.as_bytes()), cancel).await
    }

    async fn run(&self, markup: &str, archive_sha256: String, cancel: &CancellationToken) -> Result<AnalysisSnapshot> {
        let started_at = Utc::now();
        let run_id = self.run_id;
        let parsed = parse_archive(markup).context("parsing watch-history archive")?;
        let classified = self.classifier.classify_all(&parsed.records);

        let auditor = DiagnosticAuditor::new(&self.classifier);
        let month_audit = auditor.audit(&parsed.records, Granularity::Month);
        let week_audit = auditor.audit(&parsed.records, Granularity::Week);

        let ids = distinct_music_ids(&classified);
        info!(%run_id, records = parsed.records.len(), distinct_ids = ids.len(), "starting catalog enrichment");
        let report = self.enricher.enrich(&ids, cancel).await;
        if let Some(fatal) = &report.fatal {
            warn!(%run_id, error = %fatal, "enrichment stopped early; aggregating partial metadata");
        }

        let normalizer = DurationNormalizer {
            min_duration_seconds: self.config.min_duration_seconds,
        };
        let (listens, normalize) = normalizer.normalize(&classified, &report.metadata);
        info!(
            %run_id,
            normalized = normalize.normalized,
            missing_metadata = normalize.missing_metadata,
            below_minimum = normalize.below_minimum,
            "normalized listens"
        );

        Ok(AnalysisSnapshot {
            run_id,
            started_at,
            finished_at: Utc::now(),
            archive_sha256,
            malformed_records: parsed.malformed,
            funnel: PipelineFunnel {
                raw_entries: parsed.records.len(),
                music_listens: normalize.music_listens,
                listens_with_metadata: normalize.with_metadata(),
                qualified_listens: listens.len(),
            },
            normalize,
            enrichment: EnrichmentSummary {
                distinct_ids: ids.len(),
                resolved: report.metadata.len(),
                unresolved: report.unresolved,
                skipped: report.skipped.len(),
                lookup_calls: report.lookup_calls,
                cancelled: report.cancelled,
                fatal: report.fatal,
            },
            month_audit,
            week_audit,
            listens,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub reports_dir: String,
    pub summary_markdown: String,
    pub rankings_json: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `<root>/<run_id>/` with the markdown brief, rankings JSON, and Parquet snapshots.
pub async fn write_reports(snapshot: &AnalysisSnapshot, reports_root: &Path) -> Result<RunReport> {
    let reports_dir = reports_root.join(snapshot.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary_path = reports_dir.join("summary.md");
    fs::write(&summary_path, summary_markdown(snapshot, DEFAULT_TOP_N))
        .await
        .context("writing summary.md")?;

    let rankings_path = reports_dir.join("rankings.json");
    let rankings_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": snapshot,
        "overall": snapshot.rankings(PeriodScope::Overall),
        "scopes": snapshot.available_scopes(),
    }))
    .context("serializing rankings")?;
    fs::write(&rankings_path, rankings_json)
        .await
        .context("writing rankings.json")?;

    let manifest_path = export_parquet_snapshots(&reports_dir, snapshot).await?;
    info!(run_id = %snapshot.run_id, dir = %reports_dir.display(), "wrote run reports");

    Ok(RunReport {
        run_id: snapshot.run_id,
        reports_dir: reports_dir.display().to_string(),
        summary_markdown: summary_path.display().to_string(),
        rankings_json: rankings_path.display().to_string(),
        parquet_manifest: manifest_path.display().to_string(),
    })
}

fn ranking_lines(rows: &[AggregateRow]) -> String {
    if rows.is_empty() {
        return "_No qualified listens._".to_string();
    }
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let by = row
                .artist_channel
                .as_deref()
                .map(|artist| format!(" by {artist}"))
                .unwrap_or_default();
            format!(
                "{}. {}{}: {} plays, {:.1} min, score {:.1}",
                i + 1,
                row.entity_name,
                by,
                row.play_count,
                row.total_capped_minutes,
                row.listen_score
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn summary_markdown(snapshot: &AnalysisSnapshot, top_n: usize) -> String {
    let overall = snapshot.rankings(PeriodScope::Overall).truncated(top_n);
    let enrichment = &snapshot.enrichment;
    let status = match (&enrichment.fatal, enrichment.cancelled) {
        (Some(err), _) => format!("stopped: {err} ({})", err.remediation()),
        (None, true) => "cancelled".to_string(),
        (None, false) => "completed".to_string(),
    };
    let funnel = &snapshot.funnel;
    format!(
        "# Music Wrapped Run Summary\n\n\
         - Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Archive sha256: `{}`\n\n\
         ## Pipeline Funnel\n\
         - Raw entries parsed: {} ({} malformed skipped)\n- Music listens: {}\n\
         - Listens with metadata: {}\n- Final qualified listens: {}\n\n\
         ## Enrichment\n\
         - Distinct ids: {}\n- Resolved: {}\n- Unresolved: {}\n- Skipped: {}\n\
         - Lookup calls: {}\n- Status: {}\n\n\
         ## Top Songs (Overall)\n{}\n\n## Top Artists (Overall)\n{}\n",
        snapshot.run_id,
        snapshot.started_at,
        snapshot.finished_at,
        snapshot.archive_sha256,
        funnel.raw_entries,
        snapshot.malformed_records,
        funnel.music_listens,
        funnel.listens_with_metadata,
        funnel.qualified_listens,
        enrichment.distinct_ids,
        enrichment.resolved,
        enrichment.unresolved.len(),
        enrichment.skipped,
        enrichment.lookup_calls,
        status,
        ranking_lines(&overall.songs),
        ranking_lines(&overall.artists),
    )
}

async fn export_parquet_snapshots(reports_dir: &Path, snapshot: &AnalysisSnapshot) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let scopes = snapshot.available_scopes();
    let scoped = std::iter::once(PeriodScope::Overall)
        .chain(scopes.months.iter().map(|key| PeriodScope::Period(*key)))
        .map(|scope| snapshot.rankings(scope))
        .collect::<Vec<_>>();

    let songs_path = snapshot_dir.join("songs.parquet");
    let artists_path = snapshot_dir.join("artists.parquet");
    let diagnostics_path = snapshot_dir.join("diagnostics.parquet");

    write_rankings_parquet(&songs_path, scoped.iter().map(|r| r.songs.as_slice()))?;
    write_rankings_parquet(&artists_path, scoped.iter().map(|r| r.artists.as_slice()))?;
    write_diagnostics_parquet(&diagnostics_path, snapshot)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id: snapshot.run_id,
        files: vec![
            manifest_entry("songs", reports_dir, &songs_path)?,
            manifest_entry("artists", reports_dir, &artists_path)?,
            manifest_entry("diagnostics", reports_dir, &diagnostics_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_rankings_parquet<'a>(path: &Path, scoped: impl Iterator<Item = &'a [AggregateRow]>) -> Result<()> {
    let rows = scoped
        .flat_map(|rows| rows.iter().enumerate().map(|(i, row)| (i as u32 + 1, row)))
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("scope", DataType::Utf8, false),
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("entity_key", DataType::Utf8, false),
        ArrowField::new("entity_name", DataType::Utf8, false),
        ArrowField::new("artist_channel", DataType::Utf8, true),
        ArrowField::new("play_count", DataType::UInt32, false),
        ArrowField::new("total_capped_minutes", DataType::Float64, false),
        ArrowField::new("listen_score", DataType::Float64, false),
    ]));

    let scopes = StringArray::from(rows.iter().map(|(_, r)| Some(r.scope.to_string())).collect::<Vec<_>>());
    let ranks = UInt32Array::from(rows.iter().map(|(rank, _)| *rank).collect::<Vec<_>>());
    let keys = StringArray::from(rows.iter().map(|(_, r)| Some(r.entity_key.as_str())).collect::<Vec<_>>());
    let names = StringArray::from(rows.iter().map(|(_, r)| Some(r.entity_name.as_str())).collect::<Vec<_>>());
    let artists = StringArray::from(rows.iter().map(|(_, r)| r.artist_channel.as_deref()).collect::<Vec<_>>());
    let plays = UInt32Array::from(rows.iter().map(|(_, r)| r.play_count).collect::<Vec<_>>());
    let minutes = Float64Array::from(rows.iter().map(|(_, r)| r.total_capped_minutes).collect::<Vec<_>>());
    let scores = Float64Array::from(rows.iter().map(|(_, r)| r.listen_score).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(scopes),
            Arc::new(ranks),
            Arc::new(keys),
            Arc::new(names),
            Arc::new(artists),
            Arc::new(plays),
            Arc::new(minutes),
            Arc::new(scores),
        ],
    )
    .context("building rankings record batch")?;
    write_parquet(path, batch)
}

fn write_diagnostics_parquet(path: &Path, snapshot: &AnalysisSnapshot) -> Result<()> {
    let rows = [Granularity::Month, Granularity::Week]
        .into_iter()
        .flat_map(|g| snapshot.discrepancies(g).into_iter().map(move |row| (g, row)))
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("granularity", DataType::Utf8, false),
        ArrowField::new("period", DataType::Utf8, false),
        ArrowField::new("raw_entry_count", DataType::UInt64, false),
        ArrowField::new("aggregated_listens", DataType::UInt64, false),
    ]));
    let granularities = StringArray::from(
        rows.iter()
            .map(|(g, _)| {
                Some(match g {
                    Granularity::Month => "month",
                    Granularity::Week => "week",
                })
            })
            .collect::<Vec<_>>(),
    );
    let periods = StringArray::from(rows.iter().map(|(_, r)| Some(r.period.to_string())).collect::<Vec<_>>());
    let raw = UInt64Array::from(rows.iter().map(|(_, r)| r.raw_entries).collect::<Vec<_>>());
    let aggregated = UInt64Array::from(rows.iter().map(|(_, r)| r.aggregated_listens).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(granularities), Arc::new(periods), Arc::new(raw), Arc::new(aggregated)],
    )
    .context("building diagnostics record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: archive_fingerprint(&bytes),
        bytes: bytes.len() as u64,
    })
}
