use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use ymw_catalog::InMemoryCatalog;
use ymw_core::{CatalogMetadata, Granularity, PeriodKey, PeriodScope};
use ymw_sync::{inspect_file, write_reports, DiscrepancyRow, ParquetManifest, WrapConfig, WrapPipeline};

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/watch-history-sample.html")
}

fn catalog() -> InMemoryCatalog {
    InMemoryCatalog::new([
        CatalogMetadata {
            item_id: "aaaaaaaaaa1".into(),
            title: "Midnight City".into(),
            artist_channel: "M83 - Topic".into(),
            raw_duration_seconds: 243,
        },
        CatalogMetadata {
            item_id: "ccccccccc3".into(),
            title: "Dreams".into(),
            artist_channel: "Fleetwood Mac".into(),
            raw_duration_seconds: 257,
        },
    ])
}

#[tokio::test]
async fn fixture_archive_runs_end_to_end_and_writes_reports() {
    let catalog = Arc::new(catalog());
    let pipeline = WrapPipeline::new(WrapConfig::default(), catalog.clone(), Uuid::new_v4()).unwrap();
    let snapshot = pipeline
        .analyze_file(&fixture_path(), &CancellationToken::new())
        .await
        .unwrap();

    // one lookup batch covers all three distinct ids
    assert_eq!(catalog.calls().len(), 1);
    assert_eq!(snapshot.enrichment.distinct_ids, 3);
    assert!(snapshot.enrichment.unresolved.contains_key("ddddddddd4"));

    assert_eq!(snapshot.malformed_records, 1);
    assert_eq!(snapshot.funnel.raw_entries, 7);
    assert_eq!(snapshot.funnel.music_listens, 6);
    assert_eq!(snapshot.funnel.listens_with_metadata, 4);
    assert_eq!(snapshot.funnel.qualified_listens, 4);

    let overall = snapshot.rankings(PeriodScope::Overall);
    assert_eq!(overall.songs[0].entity_key, "aaaaaaaaaa1");
    assert_eq!(overall.songs[0].play_count, 3);
    let september = snapshot.rankings(PeriodScope::month(2023, 9));
    assert_eq!(september.songs[0].play_count, 2);

    assert_eq!(snapshot.month_audit.unparsed_timestamps, 1);
    let discrepancies = snapshot.discrepancies(Granularity::Month);
    assert_eq!(
        discrepancies,
        vec![
            DiscrepancyRow { period: PeriodKey::Month { year: 2023, month: 9 }, raw_entries: 3, aggregated_listens: 2 },
            DiscrepancyRow { period: PeriodKey::Month { year: 2023, month: 10 }, raw_entries: 2, aggregated_listens: 1 },
            DiscrepancyRow { period: PeriodKey::Month { year: 2023, month: 11 }, raw_entries: 1, aggregated_listens: 0 },
        ]
    );

    let dir = tempfile::tempdir().unwrap();
    let report = write_reports(&snapshot, dir.path()).await.unwrap();

    let summary = std::fs::read_to_string(&report.summary_markdown).unwrap();
    assert!(summary.contains(&snapshot.archive_sha256));
    assert!(summary.contains("Midnight City by M83 - Topic"));

    let rankings: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report.rankings_json).unwrap()).unwrap();
    assert_eq!(rankings["overall"]["songs"][0]["entity_key"], "aaaaaaaaaa1");
    assert_eq!(rankings["scopes"]["months"][0], "2023-10");

    let manifest: ParquetManifest =
        serde_json::from_str(&std::fs::read_to_string(&report.parquet_manifest).unwrap()).unwrap();
    assert_eq!(manifest.run_id, snapshot.run_id);
    assert_eq!(manifest.files.len(), 3);
    for file in &manifest.files {
        assert_eq!(file.sha256.len(), 64);
        assert!(file.bytes > 0);
        assert!(Path::new(&report.reports_dir).join(&file.path).exists());
    }
}

#[tokio::test]
async fn invalid_utf8_byte_only_damages_its_own_entry() {
    let mut bytes = std::fs::read(fixture_path()).unwrap();
    let title = b">Teardrop<";
    let at = bytes.windows(title.len()).position(|w| w == title).unwrap() + 1;
    bytes.insert(at, 0xFF);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("watch-history.html");
    std::fs::write(&path, &bytes).unwrap();

    let config = WrapConfig::default();
    let overview = inspect_file(&path, &config.classifier().unwrap()).await.unwrap();
    assert_eq!(overview.records, 7);
    assert_eq!(overview.malformed, 1);
    assert_eq!(overview.music_listens, 6);
    assert_eq!(overview.distinct_music_ids, 3);

    let pipeline = WrapPipeline::new(config, Arc::new(catalog()), Uuid::new_v4()).unwrap();
    let snapshot = pipeline.analyze_file(&path, &CancellationToken::new()).await.unwrap();
    assert_eq!(snapshot.funnel.raw_entries, 7);
    assert_eq!(snapshot.funnel.qualified_listens, 4);
}
