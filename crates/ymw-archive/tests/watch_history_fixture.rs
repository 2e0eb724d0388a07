use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ymw_archive::{parse_archive, Classifier, MonthAliases};

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/watch-history-sample.html")
}

#[test]
fn sample_archive_parses_and_classifies() {
    let markup = std::fs::read_to_string(fixture_path()).expect("read fixture");
    let parsed = parse_archive(&markup).expect("parse fixture");
    assert_eq!(parsed.malformed, 1);
    assert_eq!(parsed.records.len(), 7);

    let classifier = Classifier::new(MonthAliases::default()).unwrap();
    let listens = classifier.classify_all(&parsed.records);
    let music = listens.iter().filter(|l| l.is_music).collect::<Vec<_>>();
    assert_eq!(music.len(), 6);

    let ids = music
        .iter()
        .map(|l| l.item_id())
        .filter(|id| !id.is_empty())
        .collect::<BTreeSet<_>>();
    assert_eq!(
        ids.into_iter().collect::<Vec<_>>(),
        vec!["aaaaaaaaaa1", "ccccccccc3", "ddddddddd4"]
    );

    let untimed = listens.iter().filter(|l| l.parsed_timestamp.is_none()).count();
    assert_eq!(untimed, 1);

    // "Sept" and "Sep" spellings of the same day
    assert_eq!(
        listens[0].parsed_timestamp.unwrap().date(),
        listens[1].parsed_timestamp.unwrap().date()
    );
}
