//! Watch-history archive parsing and music-listen classification.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use regex::{Captures, Regex};
use scraper::html::Select;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use ymw_core::{CandidateRecord, ClassifiedListen};

pub const CRATE_NAME: &str = "ymw-archive";

pub const MUSIC_SERVICE_HOST: &str = "music.youtube.com";
pub const MUSIC_PRODUCT_LABEL: &str = "YouTube Music";

const OUTER_CELL: &str = "div.outer-cell";
const HEADER_CELL: &str = "div.header-cell";
const CONTENT_CELL: &str =
    "div.content-cell:not(.mdl-typography--caption):not(.mdl-typography--text-right)";
const CAPTION_CELL: &str = "div.mdl-typography--caption";
const LINK: &str = "a[href]";

const DAY_FIRST_PATTERN: &str = r"(?i)\b(\d{1,2})\s+(\p{L}{3,10})\.?,?\s+(\d{4})(?:,?\s+(\d{1,2}):(\d{2})(?::(\d{2}))?(?:\s*([ap])\.?\s?m\b\.?)?)?";
const MONTH_FIRST_PATTERN: &str = r"(?i)\b(\p{L}{3,10})\.?\s+(\d{1,2}),?\s+(\d{4})(?:,?\s+(\d{1,2}):(\d{2})(?::(\d{2}))?(?:\s*([ap])\.?\s?m\b\.?)?)?";

/// Every spelling the archive has been seen to use, keyed by month number.
const DEFAULT_MONTH_SPELLINGS: [(u32, &[&str]); 12] = [
    (1, &["jan", "january"]),
    (2, &["feb", "febr", "february"]),
    (3, &["mar", "march"]),
    (4, &["apr", "april"]),
    (5, &["may"]),
    (6, &["jun", "june"]),
    (7, &["jul", "july"]),
    (8, &["aug", "august"]),
    (9, &["sep", "sept", "september"]),
    (10, &["oct", "october"]),
    (11, &["nov", "november"]),
    (12, &["dec", "december"]),
];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Pattern(#[from] regex::Error),
    #[error("invalid month aliases file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("month number {0} is outside 1..=12")]
    InvalidMonth(u32),
}

/// Static mapping from every known month spelling to its calendar number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthAliases {
    by_spelling: HashMap<String, u32>,
}

#[derive(Debug, Deserialize)]
struct MonthAliasesFile {
    #[serde(default)]
    months: BTreeMap<u32, Vec<String>>,
}

impl Default for MonthAliases {
    fn default() -> Self {
        let mut aliases = Self {
            by_spelling: HashMap::new(),
        };
        for (month, spellings) in DEFAULT_MONTH_SPELLINGS {
            for spelling in spellings {
                aliases.insert(month, spelling);
            }
        }
        aliases
    }
}

impl MonthAliases {
    fn normalize(token: &str) -> String {
        token.trim().trim_end_matches('.').to_lowercase()
    }

    fn insert(&mut self, month: u32, spelling: &str) {
        self.by_spelling.insert(Self::normalize(spelling), month);
    }

    pub fn with_alias(mut self, month: u32, spelling: &str) -> Result<Self, ArchiveError> {
        if !(1..=12).contains(&month) {
            return Err(ArchiveError::InvalidMonth(month));
        }
        self.insert(month, spelling);
        Ok(self)
    }

    pub fn resolve(&self, token: &str) -> Option<u32> {
        self.by_spelling.get(&Self::normalize(token)).copied()
    }

    /// Built-in spellings plus the extra ones listed under `months:` in YAML.
    pub fn from_yaml_str(text: &str) -> Result<Self, ArchiveError> {
        let file: MonthAliasesFile = serde_yaml::from_str(text)?;
        let mut aliases = Self::default();
        for (month, spellings) in file.months {
            for spelling in spellings {
                aliases = aliases.with_alias(month, &spelling)?;
            }
        }
        Ok(aliases)
    }

    pub fn load_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy)]
enum DateLayout {
    DayFirst,
    MonthFirst,
}

/// Parses locale-formatted archive timestamps into naive calendar timestamps.
/// Zone suffixes ("BST", "EDT") are ignored, never converted.
#[derive(Debug, Clone)]
pub struct TimestampParser {
    aliases: MonthAliases,
    day_first: Regex,
    month_first: Regex,
}

impl TimestampParser {
    pub fn new(aliases: MonthAliases) -> Result<Self, ArchiveError> {
        Ok(Self {
            aliases,
            day_first: Regex::new(DAY_FIRST_PATTERN)?,
            month_first: Regex::new(MONTH_FIRST_PATTERN)?,
        })
    }

    pub fn parse(&self, text: &str) -> Option<NaiveDateTime> {
        [
            (&self.day_first, DateLayout::DayFirst),
            (&self.month_first, DateLayout::MonthFirst),
        ]
        .into_iter()
        .find_map(|(pattern, layout)| {
            pattern
                .captures_iter(text)
                .find_map(|caps| self.from_captures(&caps, layout))
        })
    }

    fn from_captures(&self, caps: &Captures<'_>, layout: DateLayout) -> Option<NaiveDateTime> {
        let (day_idx, month_idx) = match layout {
            DateLayout::DayFirst => (1, 2),
            DateLayout::MonthFirst => (2, 1),
        };
        let month = self.aliases.resolve(caps.get(month_idx)?.as_str())?;
        let day: u32 = caps.get(day_idx)?.as_str().parse().ok()?;
        let year: i32 = caps.get(3)?.as_str().parse().ok()?;

        let (hour, minute, second) = match caps.get(4) {
            None => (0, 0, 0),
            Some(hour) => {
                let hour: u32 = hour.as_str().parse().ok()?;
                let minute: u32 = caps.get(5)?.as_str().parse().ok()?;
                let second: u32 = match caps.get(6) {
                    Some(s) => s.as_str().parse().ok()?,
                    None => 0,
                };
                let meridiem = caps.get(7).map(|m| m.as_str().to_ascii_lowercase());
                (to_24_hour(hour, meridiem.as_deref())?, minute, second)
            }
        };

        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
    }
}

fn to_24_hour(hour: u32, meridiem: Option<&str>) -> Option<u32> {
    match (meridiem, hour) {
        (None, 0..=23) => Some(hour),
        (Some("a"), 12) => Some(0),
        (Some("a"), 1..=11) => Some(hour),
        (Some("p"), 12) => Some(12),
        (Some("p"), 1..=11) => Some(hour + 12),
        _ => None,
    }
}

/// Host of `link` is the music service domain.
pub fn link_host_is_music_service(link: &str) -> bool {
    link_host(link).is_some_and(|host| host == MUSIC_SERVICE_HOST)
}

/// Label text names the music product explicitly.
pub fn label_names_music_product(label: &str) -> bool {
    label
        .to_lowercase()
        .contains(&MUSIC_PRODUCT_LABEL.to_lowercase())
}

fn link_host(link: &str) -> Option<String> {
    let rest = link.trim().split_once("://").map_or(link.trim(), |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Video id from `watch?v=<id>`, `youtu.be/<id>` or `/shorts/<id>`; empty when absent or malformed.
pub fn extract_item_id(link: &str) -> String {
    let candidate = if let Some((_, query)) = link.split_once("watch?") {
        query
            .split(['&', '#'])
            .find_map(|pair| pair.strip_prefix("v="))
    } else if let Some((_, rest)) = link.split_once("youtu.be/") {
        rest.split(['/', '?', '&', '#']).next()
    } else if let Some((_, rest)) = link.split_once("/shorts/") {
        rest.split(['/', '?', '&', '#']).next()
    } else {
        None
    };

    match candidate {
        Some(id)
            if !id.is_empty()
                && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
        {
            id.to_string()
        }
        _ => String::new(),
    }
}

/// Decides which candidate records are music listens and parses their timestamps.
#[derive(Debug, Clone)]
pub struct Classifier {
    timestamps: TimestampParser,
}

impl Classifier {
    pub fn new(aliases: MonthAliases) -> Result<Self, ArchiveError> {
        Ok(Self {
            timestamps: TimestampParser::new(aliases)?,
        })
    }

    pub fn is_music(record: &CandidateRecord) -> bool {
        link_host_is_music_service(&record.source_link)
            || label_names_music_product(&record.label_text)
    }

    pub fn parse_timestamp(&self, text: &str) -> Option<NaiveDateTime> {
        self.timestamps.parse(text)
    }

    pub fn classify(&self, record: CandidateRecord) -> ClassifiedListen {
        let is_music = Self::is_music(&record);
        let parsed_timestamp = self.parse_timestamp(&record.raw_timestamp_text);
        ClassifiedListen {
            record,
            is_music,
            parsed_timestamp,
        }
    }

    pub fn classify_all(&self, records: &[CandidateRecord]) -> Vec<ClassifiedListen> {
        records.iter().cloned().map(|r| self.classify(r)).collect()
    }
}

struct ArchiveSelectors {
    outer: Selector,
    header: Selector,
    content: Selector,
    caption: Selector,
    link: Selector,
}

fn selector(selector: &str) -> Result<Selector, ArchiveError> {
    Selector::parse(selector).map_err(|e| ArchiveError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

impl ArchiveSelectors {
    fn new() -> Result<Self, ArchiveError> {
        Ok(Self {
            outer: selector(OUTER_CELL)?,
            header: selector(HEADER_CELL)?,
            content: selector(CONTENT_CELL)?,
            caption: selector(CAPTION_CELL)?,
            link: selector(LINK)?,
        })
    }
}

/// A parsed archive document. Records are extracted lazily through [`ArchiveDocument::records`].
pub struct ArchiveDocument {
    html: Html,
    selectors: ArchiveSelectors,
}

impl ArchiveDocument {
    pub fn parse(markup: &str) -> Result<Self, ArchiveError> {
        Ok(Self {
            html: Html::parse_document(markup),
            selectors: ArchiveSelectors::new()?,
        })
    }

    pub fn records(&self) -> CandidateStream<'_> {
        let blocks = if self.html.select(&self.selectors.outer).next().is_some() {
            Blocks::Outer(self.html.select(&self.selectors.outer))
        } else {
            Blocks::Flat(self.html.select(&self.selectors.content))
        };
        CandidateStream {
            doc: self,
            blocks,
            malformed: 0,
        }
    }

    fn record_from_outer(&self, block: ElementRef<'_>) -> Option<CandidateRecord> {
        let content = block.select(&self.selectors.content).next()?;
        let header = block.select(&self.selectors.header).next().map(collapsed_text);
        let caption = block.select(&self.selectors.caption).next().map(collapsed_text);
        self.record_from_content(content, header, caption)
    }

    fn record_from_content(
        &self,
        content: ElementRef<'_>,
        header: Option<String>,
        caption: Option<String>,
    ) -> Option<CandidateRecord> {
        let link = self.content_link(content);
        let texts = direct_texts(content);
        if link.is_empty() && texts.is_empty() {
            return None;
        }

        let action = texts
            .first()
            .filter(|t| !t.chars().any(|c| c.is_ascii_digit()))
            .cloned();
        let timestamp = texts
            .iter()
            .rev()
            .find(|t| t.chars().any(|c| c.is_ascii_digit()))
            .cloned()
            .unwrap_or_default();
        let label_text = [action, header, caption]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Some(CandidateRecord {
            raw_item_id: extract_item_id(&link),
            raw_timestamp_text: timestamp,
            label_text,
            source_link: link,
        })
    }

    /// The content link: first href carrying a video id, else the first href at all.
    fn content_link(&self, content: ElementRef<'_>) -> String {
        let hrefs = content
            .select(&self.selectors.link)
            .filter_map(|a| a.value().attr("href"))
            .map(|href| href.trim().to_string())
            .collect::<Vec<_>>();
        hrefs
            .iter()
            .find(|href| !extract_item_id(href).is_empty())
            .or_else(|| hrefs.first())
            .cloned()
            .unwrap_or_default()
    }
}

enum Blocks<'a> {
    Outer(Select<'a, 'a>),
    Flat(Select<'a, 'a>),
}

/// Lazy, single-pass sequence of candidate records. Blocks without any content are
/// skipped and counted as malformed.
pub struct CandidateStream<'a> {
    doc: &'a ArchiveDocument,
    blocks: Blocks<'a>,
    malformed: usize,
}

impl CandidateStream<'_> {
    pub fn malformed(&self) -> usize {
        self.malformed
    }
}

impl Iterator for CandidateStream<'_> {
    type Item = CandidateRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match &mut self.blocks {
                Blocks::Outer(blocks) => {
                    let block = blocks.next()?;
                    self.doc.record_from_outer(block)
                }
                Blocks::Flat(cells) => {
                    let cell = cells.next()?;
                    self.doc.record_from_content(cell, preceding_header(cell), None)
                }
            };
            match record {
                Some(record) => return Some(record),
                None => {
                    self.malformed += 1;
                    debug!(malformed = self.malformed, "skipping archive entry without content");
                }
            }
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collapsed_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

/// Text nodes that are direct children of `element` (outside links), collapsed and non-empty.
fn direct_texts(element: ElementRef<'_>) -> Vec<String> {
    element
        .children()
        .filter_map(|node| node.value().as_text().map(|text| collapse_whitespace(text)))
        .filter(|text| !text.is_empty())
        .collect()
}

fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// Header text for a flat-layout content cell; another entry's content cell in between means none.
fn preceding_header(cell: ElementRef<'_>) -> Option<String> {
    let sibling = cell
        .prev_siblings()
        .filter_map(ElementRef::wrap)
        .find(|e| has_class(*e, "header-cell") || has_class(*e, "content-cell"))?;
    if !has_class(sibling, "header-cell") {
        return None;
    }
    Some(collapsed_text(sibling)).filter(|text| !text.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedArchive {
    pub records: Vec<CandidateRecord>,
    pub malformed: usize,
}

/// Parse the whole archive and collect its candidate records.
pub fn parse_archive(markup: &str) -> Result<ParsedArchive, ArchiveError> {
    let document = ArchiveDocument::parse(markup)?;
    let mut stream = document.records();
    let records = stream.by_ref().collect::<Vec<_>>();
    let malformed = stream.malformed();
    info!(records = records.len(), malformed, "parsed archive");
    Ok(ParsedArchive { records, malformed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn classifier() -> Classifier {
        Classifier::new(MonthAliases::default()).unwrap()
    }

    fn record(label: &str, link: &str) -> CandidateRecord {
        CandidateRecord {
            raw_item_id: extract_item_id(link),
            raw_timestamp_text: String::new(),
            label_text: label.to_string(),
            source_link: link.to_string(),
        }
    }

    fn outer_cell(header: &str, content: &str) -> String {
        format!(
            r#"<div class="outer-cell mdl-cell mdl-cell--12-col mdl-shadow--2dp"><div class="mdl-grid">
<div class="header-cell mdl-cell mdl-cell--12-col"><p class="mdl-typography--title">{header}<br></p></div>
<div class="content-cell mdl-cell mdl-cell--6-col mdl-typography--body-1">{content}</div>
<div class="content-cell mdl-cell mdl-cell--6-col mdl-typography--body-1 mdl-typography--text-right"></div>
<div class="content-cell mdl-cell mdl-cell--12-col mdl-typography--caption"><b>Products:</b><br>&emsp;YouTube<br></div>
</div></div>"#
        )
    }

    #[test]
    fn label_signal_alone_classifies_as_music() {
        let r = record("Watched YouTube Music", "https://youtube.com/watch?v=XYZ");
        let listen = classifier().classify(r);
        assert!(listen.is_music);
        assert_eq!(listen.item_id(), "XYZ");
    }

    #[test]
    fn link_host_alone_classifies_as_music() {
        let r = record("Watched", "https://music.youtube.com/watch?v=abcDEF12345&list=RD");
        assert!(Classifier::is_music(&r));
        assert_eq!(r.raw_item_id, "abcDEF12345");
    }

    #[test]
    fn entries_matching_neither_signal_are_not_music() {
        let r = record("Watched YouTube", "https://www.youtube.com/watch?v=abcDEF12345");
        assert!(!Classifier::is_music(&r));
        assert!(!link_host_is_music_service("https://notmusic.youtube.com.evil.test/watch?v=a"));
        assert!(!link_host_is_music_service(""));
    }

    #[test]
    fn irregular_month_abbreviations_normalize_to_the_same_date() {
        let c = classifier();
        let sept = c.parse_timestamp("Sept 3, 2023").unwrap();
        let sep = c.parse_timestamp("Sep 3, 2023").unwrap();
        assert_eq!(sept, sep);
        assert_eq!(sept.date(), NaiveDate::from_ymd_opt(2023, 9, 3).unwrap());
        assert_eq!(
            c.parse_timestamp("3 Sept 2023, 14:22:05 BST").unwrap().date(),
            sep.date()
        );
    }

    #[test]
    fn day_first_and_month_first_layouts_parse_times() {
        let c = classifier();
        let a = c.parse_timestamp("Watched at 3 Sept 2023, 14:22:05 BST").unwrap();
        assert_eq!(a, NaiveDate::from_ymd_opt(2023, 9, 3).unwrap().and_hms_opt(14, 22, 5).unwrap());

        let b = c.parse_timestamp("Jun 14, 2024, 9:05:00\u{202f}PM EDT").unwrap();
        assert_eq!(b, NaiveDate::from_ymd_opt(2024, 6, 14).unwrap().and_hms_opt(21, 5, 0).unwrap());

        let midnight = c.parse_timestamp("January 1, 2024, 12:00:30 AM").unwrap();
        assert_eq!(midnight.time(), chrono::NaiveTime::from_hms_opt(0, 0, 30).unwrap());
    }

    #[test]
    fn unparseable_timestamps_yield_none() {
        let c = classifier();
        assert!(c.parse_timestamp("").is_none());
        assert!(c.parse_timestamp("yesterday").is_none());
        assert!(c.parse_timestamp("31 Feb 2023, 10:00:00").is_none());
        assert!(c.parse_timestamp("3 Smarch 2023, 10:00:00").is_none());
        assert!(c.parse_timestamp("3 Sep 2023, 25:00:00").is_none());
    }

    #[test]
    fn month_aliases_extend_from_yaml() {
        let aliases = MonthAliases::from_yaml_str("months:\n  9: [\"Setembro\"]\n  3: [\"Mär\"]\n").unwrap();
        assert_eq!(aliases.resolve("setembro"), Some(9));
        assert_eq!(aliases.resolve("Sept."), Some(9));
        let c = Classifier::new(aliases).unwrap();
        assert_eq!(c.parse_timestamp("4 Mär 2024, 08:00:00").unwrap().month(), 3);
        assert!(MonthAliases::from_yaml_str("months:\n  13: [\"Undecember\"]\n").is_err());
    }

    #[test]
    fn month_aliases_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("months.yaml");
        fs::write(&path, "months:\n  12: [\"Dez\"]\n").unwrap();
        let aliases = MonthAliases::load_yaml(&path).unwrap();
        assert_eq!(aliases.resolve("dez"), Some(12));
        assert!(MonthAliases::load_yaml(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn item_ids_come_from_watch_short_and_shorts_links() {
        assert_eq!(extract_item_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"), "dQw4w9WgXcQ");
        assert_eq!(extract_item_id("https://music.youtube.com/watch?list=x&v=dQw4w9WgXcQ"), "dQw4w9WgXcQ");
        assert_eq!(extract_item_id("https://youtu.be/dQw4w9WgXcQ?t=4"), "dQw4w9WgXcQ");
        assert_eq!(extract_item_id("https://www.youtube.com/shorts/dQw4w9WgXcQ"), "dQw4w9WgXcQ");
        assert_eq!(extract_item_id("https://www.youtube.com/channel/UC123"), "");
        assert_eq!(extract_item_id("https://www.youtube.com/watch?v=bad<id>"), "");
    }

    #[test]
    fn item_ids_of_any_length_are_kept_when_alphabet_matches() {
        assert_eq!(extract_item_id("https://youtube.com/watch?v=XYZ"), "XYZ");
        assert_eq!(extract_item_id("https://youtube.com/watch?v=ab&t=3"), "ab");
        assert_eq!(extract_item_id("https://youtube.com/watch?v="), "");
        assert_eq!(extract_item_id("https://youtube.com/watch?v=a.b"), "");
    }

    #[test]
    fn outer_cells_yield_records_with_labels_and_timestamps() {
        let html = format!(
            "<html><body>{}{}</body></html>",
            outer_cell(
                "YouTube Music",
                r#"Watched&nbsp;<a href="https://music.youtube.com/watch?v=AAAAAAAAAAA">Song A</a><br><a href="https://www.youtube.com/channel/UC1">Artist A</a><br>3 Sept 2023, 14:22:05 BST<br>"#,
            ),
            outer_cell(
                "YouTube",
                r#"Watched&nbsp;<a href="https://www.youtube.com/watch?v=BBBBBBBBBBB">A vlog</a><br>4 Sep 2023, 09:00:00 BST<br>"#,
            ),
        );
        let parsed = parse_archive(&html).unwrap();
        assert_eq!(parsed.malformed, 0);
        assert_eq!(parsed.records.len(), 2);

        let first = &parsed.records[0];
        assert_eq!(first.raw_item_id, "AAAAAAAAAAA");
        assert_eq!(first.raw_timestamp_text, "3 Sept 2023, 14:22:05 BST");
        assert!(first.label_text.starts_with("Watched YouTube Music"));
        assert_eq!(first.source_link, "https://music.youtube.com/watch?v=AAAAAAAAAAA");

        let second = &parsed.records[1];
        assert!(!Classifier::is_music(second));
    }

    #[test]
    fn corrupt_entries_are_skipped_without_aborting() {
        let html = format!(
            "<html><body>{}<div class=\"outer-cell\"><div class=\"mdl-grid\"><div class=\"header-cell\">YouTube</div></div></div>{}</body></html>",
            outer_cell("YouTube Music", r#"Watched <a href="https://music.youtube.com/watch?v=AAAAAAAAAAA">A</a><br>1 Jan 2024, 10:00:00 UTC"#),
            outer_cell("YouTube Music", "Watched a video that has been removed<br>2 Jan 2024, 10:00:00 UTC"),
        );
        let document = ArchiveDocument::parse(&html).unwrap();
        let mut stream = document.records();
        let records = stream.by_ref().collect::<Vec<_>>();
        assert_eq!(stream.malformed(), 1);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].raw_item_id, "");
        assert_eq!(records[1].source_link, "");
        assert_eq!(records[1].raw_timestamp_text, "2 Jan 2024, 10:00:00 UTC");
    }

    #[test]
    fn flat_layout_uses_preceding_header_div() {
        let html = r#"<html><body>
<div class="header-cell">YouTube Music</div>
<div class="content-cell">Watched <a href="https://www.youtube.com/watch?v=CCCCCCCCCCC">Song C</a><br>Sep 5, 2023, 7:15:00 PM EDT</div>
<div class="content-cell">Watched <a href="https://www.youtube.com/watch?v=DDDDDDDDDDD">Clip</a><br>Sep 6, 2023, 7:15:00 PM EDT</div>
</body></html>"#;
        let parsed = parse_archive(html).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].label_text, "Watched YouTube Music");
        assert!(Classifier::is_music(&parsed.records[0]));
        assert!(!Classifier::is_music(&parsed.records[1]));
        assert!(parsed.records[1].label_text.starts_with("Watched"));
        assert!(!parsed.records[1].label_text.contains("Song C"));
    }

    #[test]
    fn flat_layout_does_not_borrow_previous_entry_title_as_header() {
        let html = r#"<html><body>
<div class="header-cell">YouTube</div>
<div class="content-cell">Watched <a href="https://www.youtube.com/watch?v=EEEEEEEEEEE">Best of YouTube Music 2023</a><br>Sep 4, 2023, 7:15:00 PM EDT</div>
<div class="content-cell">Watched <a href="https://www.youtube.com/watch?v=FFFFFFFFFFF">Cooking pasta</a><br>Sep 5, 2023, 7:15:00 PM EDT</div>
</body></html>"#;
        let parsed = parse_archive(html).unwrap();
        assert_eq!(parsed.records.len(), 2);
        let cooking = &parsed.records[1];
        assert_eq!(cooking.raw_item_id, "FFFFFFFFFFF");
        assert!(!cooking.label_text.contains("Best of YouTube Music"));
        assert!(!Classifier::is_music(cooking));
    }
}
