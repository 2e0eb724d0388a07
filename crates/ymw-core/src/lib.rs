//! Core listening-history model shared by every ymw crate.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ymw-core";

/// Counted duration ceiling for a single listen (7 minutes).
pub const DURATION_CAP_SECONDS: u32 = 420;

/// One history entry as found in the archive markup, music or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CandidateRecord {
    pub raw_item_id: String,
    pub raw_timestamp_text: String,
    pub label_text: String,
    pub source_link: String,
}

/// A candidate record annotated by the classifier. Never dropped, only annotated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedListen {
    pub record: CandidateRecord,
    pub is_music: bool,
    pub parsed_timestamp: Option<NaiveDateTime>,
}

impl ClassifiedListen {
    pub fn item_id(&self) -> &str {
        &self.record.raw_item_id
    }
}

/// Authoritative per-item metadata resolved through the catalog lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogMetadata {
    pub item_id: String,
    pub title: String,
    pub artist_channel: String,
    pub raw_duration_seconds: u32,
}

/// A music listen joined with its metadata and capped duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListen {
    pub listen: ClassifiedListen,
    pub metadata: CatalogMetadata,
    pub capped_duration_seconds: u32,
}

impl NormalizedListen {
    pub fn item_id(&self) -> &str {
        &self.metadata.item_id
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        self.listen.parsed_timestamp
    }

    pub fn capped_minutes(&self) -> f64 {
        f64::from(self.capped_duration_seconds) / 60.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeParseError {
    #[error("invalid month key `{0}` (expected YYYY-MM)")]
    Month(String),
    #[error("invalid week key `{0}` (expected YYYY-Www)")]
    Week(String),
    #[error("invalid scope `{0}` (expected overall, month:<YYYY-MM> or week:<YYYY-Www>)")]
    Scope(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Month,
    Week,
}

impl FromStr for Granularity {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "month" | "monthly" => Ok(Self::Month),
            "week" | "weekly" => Ok(Self::Week),
            _ => Err(ScopeParseError::Scope(s.to_string())),
        }
    }
}

/// Calendar bucket: `YYYY-MM` for months, ISO `YYYY-Www` for Monday-start weeks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PeriodKey {
    Month { year: i32, month: u32 },
    Week { iso_year: i32, week: u32 },
}

impl PeriodKey {
    pub fn for_timestamp(granularity: Granularity, ts: NaiveDateTime) -> Self {
        Self::for_date(granularity, ts.date())
    }

    pub fn for_date(granularity: Granularity, date: NaiveDate) -> Self {
        match granularity {
            Granularity::Month => Self::Month {
                year: date.year(),
                month: date.month(),
            },
            Granularity::Week => {
                let iso = date.iso_week();
                Self::Week {
                    iso_year: iso.year(),
                    week: iso.week(),
                }
            }
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Self::Month { .. } => Granularity::Month,
            Self::Week { .. } => Granularity::Week,
        }
    }

    /// First calendar day of the period.
    pub fn start_date(&self) -> NaiveDate {
        match *self {
            Self::Month { year, month } => {
                NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
            }
            Self::Week { iso_year, week } => {
                NaiveDate::from_isoywd_opt(iso_year, week, Weekday::Mon).unwrap_or(NaiveDate::MIN)
            }
        }
    }

    pub fn previous(&self) -> Self {
        match *self {
            Self::Month { year, month } if month == 1 => Self::Month {
                year: year - 1,
                month: 12,
            },
            Self::Month { year, month } => Self::Month {
                year,
                month: month - 1,
            },
            Self::Week { .. } => {
                Self::for_date(Granularity::Week, self.start_date() - Duration::days(7))
            }
        }
    }

    pub fn next(&self) -> Self {
        match *self {
            Self::Month { year, month } if month == 12 => Self::Month {
                year: year + 1,
                month: 1,
            },
            Self::Month { year, month } => Self::Month {
                year,
                month: month + 1,
            },
            Self::Week { .. } => {
                Self::for_date(Granularity::Week, self.start_date() + Duration::days(7))
            }
        }
    }

    /// Human label used by summaries: "September 2023" or "Week of Sep 04, 2023".
    pub fn label(&self) -> String {
        match self {
            Self::Month { .. } => self.start_date().format("%B %Y").to_string(),
            Self::Week { .. } => self.start_date().format("Week of %b %d, %Y").to_string(),
        }
    }

    /// Short name for growth comparisons: the month name, or "previous week".
    pub fn comparison_name(&self) -> String {
        match self {
            Self::Month { .. } => self.start_date().format("%B").to_string(),
            Self::Week { .. } => "previous week".to_string(),
        }
    }

    pub fn parse_month(s: &str) -> Result<Self, ScopeParseError> {
        let err = || ScopeParseError::Month(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(err)?;
        let year: i32 = year.parse().map_err(|_| err())?;
        let month: u32 = month.parse().map_err(|_| err())?;
        if !(1..=12).contains(&month) {
            return Err(err());
        }
        Ok(Self::Month { year, month })
    }

    pub fn parse_week(s: &str) -> Result<Self, ScopeParseError> {
        let err = || ScopeParseError::Week(s.to_string());
        let (year, week) = s.trim().split_once("-W").ok_or_else(err)?;
        let iso_year: i32 = year.parse().map_err(|_| err())?;
        let week: u32 = week.parse().map_err(|_| err())?;
        NaiveDate::from_isoywd_opt(iso_year, week, Weekday::Mon).ok_or_else(err)?;
        Ok(Self::Week { iso_year, week })
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            Self::Week { iso_year, week } => write!(f, "{iso_year:04}-W{week:02}"),
        }
    }
}

impl FromStr for PeriodKey {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains("-W") {
            Self::parse_week(s)
        } else {
            Self::parse_month(s)
        }
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = ScopeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodKey> for String {
    fn from(value: PeriodKey) -> Self {
        value.to_string()
    }
}

/// Time window an aggregation is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum PeriodScope {
    #[default]
    Overall,
    Period(PeriodKey),
}

impl PeriodScope {
    pub fn month(year: i32, month: u32) -> Self {
        Self::Period(PeriodKey::Month { year, month })
    }

    pub fn week(iso_year: i32, week: u32) -> Self {
        Self::Period(PeriodKey::Week { iso_year, week })
    }

    /// Untimestamped listens belong to `Overall` only.
    pub fn contains(&self, ts: Option<NaiveDateTime>) -> bool {
        match (self, ts) {
            (Self::Overall, _) => true,
            (Self::Period(_), None) => false,
            (Self::Period(key), Some(ts)) => PeriodKey::for_timestamp(key.granularity(), ts) == *key,
        }
    }

    pub fn period(&self) -> Option<PeriodKey> {
        match self {
            Self::Overall => None,
            Self::Period(key) => Some(*key),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Overall => "Overall".to_string(),
            Self::Period(key) => key.label(),
        }
    }
}

impl fmt::Display for PeriodScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overall => f.write_str("overall"),
            Self::Period(key @ PeriodKey::Month { .. }) => write!(f, "month:{key}"),
            Self::Period(key @ PeriodKey::Week { .. }) => write!(f, "week:{key}"),
        }
    }
}

impl FromStr for PeriodScope {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("overall") {
            return Ok(Self::Overall);
        }
        match trimmed.split_once(':') {
            Some((kind, key)) if kind.eq_ignore_ascii_case("month") => {
                Ok(Self::Period(PeriodKey::parse_month(key)?))
            }
            Some((kind, key)) if kind.eq_ignore_ascii_case("week") => {
                Ok(Self::Period(PeriodKey::parse_week(key)?))
            }
            _ => Err(ScopeParseError::Scope(s.to_string())),
        }
    }
}

impl TryFrom<String> for PeriodScope {
    type Error = ScopeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodScope> for String {
    fn from(value: PeriodScope) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Song,
    Artist,
}

/// Ranked statistics for one song or artist within one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub entity: EntityKind,
    pub entity_key: String,
    pub entity_name: String,
    /// Channel of a song row; `None` for artist rows.
    pub artist_channel: Option<String>,
    pub scope: PeriodScope,
    pub play_count: u32,
    pub total_capped_minutes: f64,
    pub listen_score: f64,
}

/// Raw, pre-filter entry count for one calendar period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRow {
    pub period: PeriodKey,
    pub raw_entry_count: u64,
}
