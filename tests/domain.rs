use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};

use biblio_etl::domain::{InstitutionId, SnapshotId, SnapshotSelector, YearRange};
use biblio_etl::error::BiblioError;

#[test]
fn institution_id_rejects_other_entities() {
    let id: InstitutionId = "I185261750".parse().unwrap();
    assert_eq!(id.to_string(), "I185261750");

    assert_matches!(
        "W1001".parse::<InstitutionId>(),
        Err(BiblioError::InvalidInstitutionId(_))
    );
    assert_matches!(
        "".parse::<InstitutionId>(),
        Err(BiblioError::InvalidInstitutionId(_))
    );
}

#[test]
fn year_range_parses_single_year_and_span() {
    let range: YearRange = "2020-2024".parse().unwrap();
    assert_eq!((range.from, range.to), (2020, 2024));
    assert_eq!(range.to_string(), "2020-2024");

    let single: YearRange = " 2023 ".parse().unwrap();
    assert_eq!(single, YearRange::new(2023, 2023).unwrap());

    assert_matches!(
        "2024-2020".parse::<YearRange>(),
        Err(BiblioError::InvalidYearRange(_))
    );
    assert_matches!(
        "recent".parse::<YearRange>(),
        Err(BiblioError::InvalidYearRange(_))
    );
}

#[test]
fn snapshot_ids_sort_by_time() {
    let earlier = SnapshotId::from_timestamp(Utc.with_ymd_and_hms(2026, 9, 30, 23, 59, 59).unwrap());
    let later = SnapshotId::from_timestamp(Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap());
    assert_eq!(earlier.as_str(), "20260930T235959Z");
    assert!(earlier < later);
    assert_eq!(
        later.created_at(),
        Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap()
    );

    assert_matches!(
        "2026-10-01".parse::<SnapshotId>(),
        Err(BiblioError::InvalidSnapshotId(_))
    );
}

#[test]
fn selector_parses_latest_or_id() {
    assert_eq!(
        "latest".parse::<SnapshotSelector>().unwrap(),
        SnapshotSelector::Latest
    );
    assert_eq!(
        "20261001T120000Z".parse::<SnapshotSelector>().unwrap(),
        SnapshotSelector::Id("20261001T120000Z".parse().unwrap())
    );
    assert!("yesterday".parse::<SnapshotSelector>().is_err());
}
