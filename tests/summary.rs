use biblio_etl::openalex::decode_page;
use biblio_etl::summary::{DisciplineStats, SnapshotSummary, YearStats};
use biblio_etl::transform::{TableSet, TransformOptions};

fn fixture_tables() -> TableSet {
    let body = serde_json::from_str(include_str!("fixtures/works_page.json")).unwrap();
    let works = decode_page(body).unwrap().works;
    let options = TransformOptions {
        home_institution: Some("I185261750".parse().unwrap()),
        top_concepts: 5,
    };
    TableSet::from_raw(&works, &options)
}

#[test]
fn fixture_headline_figures() {
    let summary = SnapshotSummary::from_tables(&fixture_tables());

    assert_eq!(summary.total_works, 3);
    assert_eq!(summary.total_citations, 14);
    assert_eq!(summary.mean_citations, 4.7);
    assert_eq!(summary.open_access_pct, 50.0);
    assert_eq!(summary.collaborating_countries, 3);
    assert_eq!(summary.collaborating_institutions, 4);
}

#[test]
fn fixture_breakdowns() {
    let summary = SnapshotSummary::from_tables(&fixture_tables());

    assert_eq!(
        summary.per_year,
        vec![
            YearStats {
                year: 2021,
                works: 1,
                mean_citations: 10.0,
            },
            YearStats {
                year: 2022,
                works: 2,
                mean_citations: 2.0,
            },
        ]
    );
    assert_eq!(
        summary.top_types,
        vec![("article".to_string(), 2), ("review".to_string(), 1)]
    );
    let countries = summary
        .top_countries
        .iter()
        .map(|(code, works)| (code.as_str(), *works))
        .collect::<Vec<_>>();
    assert_eq!(countries, vec![("DE", 1), ("FR", 1), ("US", 1)]);
    assert_eq!(
        summary.disciplines,
        vec![DisciplineStats {
            concept: "Medicine".to_string(),
            works: 1,
            mean_citations: 10.0,
            open_access_pct: 100.0,
            mean_authors: 3.0,
        }]
    );
}

#[test]
fn empty_snapshot_has_zero_figures() {
    let summary = SnapshotSummary::from_tables(&TableSet::default());
    assert_eq!(summary.total_works, 0);
    assert_eq!(summary.mean_citations, 0.0);
    assert_eq!(summary.open_access_pct, 0.0);
    assert!(summary.per_year.is_empty());
    assert!(summary.disciplines.is_empty());
}
