use std::fs;

use arrow_array::{Array, Int64Array};
use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use biblio_etl::domain::{QueryScope, SnapshotId, SnapshotSelector};
use biblio_etl::error::BiblioError;
use biblio_etl::openalex::{RawWork, decode_page};
use biblio_etl::schema::Table;
use biblio_etl::store::{SnapshotManifest, SnapshotOrigin, Store};
use biblio_etl::transform::{AuthorshipRow, TableSet, TransformOptions};

fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap();
    (temp, Store::new(root))
}

fn fixture_works() -> Vec<RawWork> {
    let body = serde_json::from_str(include_str!("fixtures/works_page.json")).unwrap();
    decode_page(body).unwrap().works
}

fn fixture_tables() -> TableSet {
    let options = TransformOptions {
        home_institution: Some("I185261750".parse().unwrap()),
        top_concepts: 5,
    };
    let mut tables = TableSet::from_raw(&fixture_works(), &options);
    if let Some(row) = tables.institutions.get_mut("I2") {
        row.latitude = Some(37.43);
        row.longitude = Some(-122.17);
    }
    tables
}

fn manifest(id: &str) -> SnapshotManifest {
    let scope = QueryScope::new("I185261750".parse().unwrap(), "2020-2024".parse().unwrap());
    SnapshotManifest::new(id.parse().unwrap(), scope, SnapshotOrigin::FullRefresh)
}

#[test]
fn write_then_read_latest_returns_same_tables() {
    let (_temp, store) = temp_store();
    let tables = fixture_tables();
    store.write(&tables, &manifest("20261001T120000Z")).unwrap();

    let snapshot = store.read(&SnapshotSelector::Latest).unwrap();
    assert_eq!(snapshot.tables, tables);
    assert_eq!(snapshot.manifest.counts, tables.counts());
    assert_eq!(snapshot.manifest.snapshot_id.as_str(), "20261001T120000Z");

    let pointer = fs::read_to_string(store.latest_path().as_std_path()).unwrap();
    assert_eq!(pointer, "20261001T120000Z");
}

#[test]
fn empty_tables_round_trip() {
    let (_temp, store) = temp_store();
    store
        .write(&TableSet::default(), &manifest("20261001T120000Z"))
        .unwrap();
    let snapshot = store.read(&SnapshotSelector::Latest).unwrap();
    assert_eq!(snapshot.tables, TableSet::default());
}

#[test]
fn read_missing_snapshot_is_not_found() {
    let (_temp, store) = temp_store();
    assert_matches!(
        store.read(&SnapshotSelector::Latest),
        Err(BiblioError::SnapshotNotFound(_))
    );

    store
        .write(&fixture_tables(), &manifest("20261001T120000Z"))
        .unwrap();
    let missing: SnapshotId = "20200101T000000Z".parse().unwrap();
    assert_matches!(
        store.read(&SnapshotSelector::Id(missing)),
        Err(BiblioError::SnapshotNotFound(_))
    );
}

#[test]
fn existing_snapshot_is_never_overwritten() {
    let (_temp, store) = temp_store();
    let tables = fixture_tables();
    store.write(&tables, &manifest("20261001T120000Z")).unwrap();

    let err = store
        .write(&TableSet::default(), &manifest("20261001T120000Z"))
        .unwrap_err();
    assert_matches!(err, BiblioError::WriteConflict(_));
    assert_eq!(store.read(&SnapshotSelector::Latest).unwrap().tables, tables);
}

#[test]
fn invalid_tables_leave_no_snapshot() {
    let (_temp, store) = temp_store();
    let mut tables = fixture_tables();
    tables.authorships.push(AuthorshipRow {
        work_id: "W404".to_string(),
        author_id: "A1".to_string(),
        institution_id: None,
        author_position: None,
        author_order: 0,
    });

    let err = store.write(&tables, &manifest("20261001T120000Z")).unwrap_err();
    assert_matches!(err, BiblioError::InvariantViolation(_));
    assert!(store.list_snapshots().unwrap().is_empty());
    assert!(!store.latest_path().as_std_path().exists());
}

#[test]
fn staging_directories_are_invisible() {
    let (_temp, store) = temp_store();
    fs::create_dir_all(store.snapshots_dir().join(".staging-abc").as_std_path()).unwrap();
    fs::create_dir_all(store.snapshots_dir().join("20261001T120000Z").as_std_path()).unwrap();

    assert!(store.list_snapshots().unwrap().is_empty());
    assert_eq!(store.latest_id().unwrap(), None);
}

#[test]
fn write_lock_is_exclusive() {
    let (_temp, store) = temp_store();
    let lock = store.acquire_write_lock().unwrap();
    assert!(store.lock_path().as_std_path().exists());

    let err = store.acquire_write_lock().unwrap_err();
    assert_matches!(err, BiblioError::WriteConflict(ref holder) if holder.contains("pid="));

    drop(lock);
    assert!(!store.lock_path().as_std_path().exists());
    let _again = store.acquire_write_lock().unwrap();
}

#[test]
fn force_unlock_clears_stale_lock() {
    let (_temp, store) = temp_store();
    store.ensure_root().unwrap();
    fs::write(store.lock_path().as_std_path(), "pid=1").unwrap();

    assert!(store.force_unlock().unwrap());
    assert!(!store.force_unlock().unwrap());
    let _lock = store.acquire_write_lock().unwrap();
}

#[test]
fn prune_keeps_newest_snapshots() {
    let (_temp, store) = temp_store();
    let tables = fixture_tables();
    let ids = [
        "20261001T120000Z",
        "20261002T120000Z",
        "20261003T120000Z",
        "20261004T120000Z",
    ];
    for id in ids {
        store.write(&tables, &manifest(id)).unwrap();
        store.save_raw(&manifest(id), &fixture_works()).unwrap();
    }

    let removed = store.prune(2).unwrap();
    let removed = removed.iter().map(SnapshotId::as_str).collect::<Vec<_>>();
    assert_eq!(removed, vec!["20261001T120000Z", "20261002T120000Z"]);

    let left = store.list_snapshots().unwrap();
    assert_eq!(left.len(), 2);
    assert!(!store.raw_path(&ids[0].parse().unwrap()).as_std_path().exists());
    assert!(
        !store
            .raw_manifest_path(&ids[0].parse().unwrap())
            .as_std_path()
            .exists()
    );
    assert!(store.raw_path(&ids[3].parse().unwrap()).as_std_path().exists());
}

#[test]
fn prune_sweeps_raw_caches_older_than_kept_snapshots() {
    let (_temp, store) = temp_store();
    let tables = fixture_tables();
    let works = fixture_works();
    for id in ["20261002T120000Z", "20261003T120000Z", "20261004T120000Z"] {
        store.write(&tables, &manifest(id)).unwrap();
        store.save_raw(&manifest(id), &works).unwrap();
    }
    // Raw caches of runs that never produced a snapshot.
    store.save_raw(&manifest("20261001T120000Z"), &works).unwrap();
    store.save_raw(&manifest("20261005T120000Z"), &works).unwrap();

    store.prune(2).unwrap();
    let raw = store.list_raw().unwrap();
    let raw = raw.iter().map(SnapshotId::as_str).collect::<Vec<_>>();
    assert_eq!(
        raw,
        vec!["20261003T120000Z", "20261004T120000Z", "20261005T120000Z"]
    );
    assert!(
        !store
            .raw_manifest_path(&"20261001T120000Z".parse().unwrap())
            .as_std_path()
            .exists()
    );
}

#[test]
fn prune_never_removes_latest() {
    let (_temp, store) = temp_store();
    let tables = fixture_tables();
    store.write(&tables, &manifest("20261002T120000Z")).unwrap();
    store.write(&tables, &manifest("20261003T120000Z")).unwrap();
    store.write(&tables, &manifest("20261001T120000Z")).unwrap();

    // LATEST now points at the oldest id.
    let removed = store.prune(1).unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].as_str(), "20261002T120000Z");
    assert_eq!(
        store.latest_id().unwrap().unwrap().as_str(),
        "20261001T120000Z"
    );
    assert_eq!(store.list_snapshots().unwrap().len(), 2);
}

#[test]
fn read_columns_projects_requested_columns() {
    let (_temp, store) = temp_store();
    store
        .write(&fixture_tables(), &manifest("20261001T120000Z"))
        .unwrap();

    let batches = store
        .read_columns(&SnapshotSelector::Latest, Table::Works, &["id", "cited_by_count"])
        .unwrap();
    let batch = &batches[0];
    assert_eq!(batch.num_columns(), 2);
    assert_eq!(batch.schema().field(0).name(), "id");
    assert_eq!(batch.schema().field(1).name(), "cited_by_count");

    let cited = batch
        .column(1)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(cited.len(), 3);
    assert_eq!(cited.null_count(), 1);

    let err = store
        .read_columns(&SnapshotSelector::Latest, Table::Works, &["abstract"])
        .unwrap_err();
    assert_matches!(err, BiblioError::SchemaMismatch(_));
}

#[test]
fn raw_cache_round_trips() {
    let (_temp, store) = temp_store();
    let id: SnapshotId = "20261001T120000Z".parse().unwrap();
    let works = fixture_works();

    let mut run = manifest(id.as_str());
    run.skipped_records = 1;
    let path = store.save_raw(&run, &works).unwrap();
    assert!(path.as_str().ends_with(".jsonl.gz"));
    assert_eq!(store.load_raw(&id).unwrap(), works);
    assert_eq!(store.load_raw_manifest(&id).unwrap(), run);
    assert_eq!(store.list_raw().unwrap(), vec![id]);

    let other: SnapshotId = "20261002T120000Z".parse().unwrap();
    assert_matches!(store.load_raw(&other), Err(BiblioError::SnapshotNotFound(_)));
    assert_matches!(
        store.load_raw_manifest(&other),
        Err(BiblioError::SnapshotNotFound(_))
    );
}

#[test]
fn manifests_list_in_order() {
    let (_temp, store) = temp_store();
    let tables = fixture_tables();
    store.write(&tables, &manifest("20261002T120000Z")).unwrap();
    store.write(&tables, &manifest("20261001T120000Z")).unwrap();

    let manifests = store.list_manifests().unwrap();
    let ids = manifests
        .iter()
        .map(|m| m.snapshot_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["20261001T120000Z", "20261002T120000Z"]);
    assert_eq!(manifests[0].counts.works, 3);
}
