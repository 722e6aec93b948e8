use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;

use biblio_etl::config::{Config, ConfigLoader, apply_env};
use biblio_etl::error::BiblioError;

fn write_config(dir: &tempfile::TempDir, body: &str) -> String {
    let path = dir.path().join("biblio-etl.json");
    fs::write(&path, body).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn resolve_reads_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let body = json!({
        "schema_version": 1,
        "scope": {"institution": "https://openalex.org/I27837315", "years": "2019-2021"},
        "api": {"per_page": 500, "mailto": "  "},
        "retry": {"max_attempts": 0, "base_delay_ms": 250},
        "store": {"data_dir": dir.path().join("data").to_string_lossy(), "keep_snapshots": 3},
        "refresh": {"hydrate_geo": false, "top_concepts": 3}
    });
    let path = write_config(&dir, &body.to_string());

    let config = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(config.scope.institution.as_str(), "I27837315");
    assert_eq!(config.scope.filter(), "authorships.institutions.id:I27837315,publication_year:2019-2021");
    assert_eq!(config.api.per_page, 200);
    assert_eq!(config.retry.max_attempts, 1);
    assert_eq!(config.retry.base_delay, Duration::from_millis(250));
    assert_eq!(config.store.keep_snapshots, 3);
    assert!(!config.refresh.hydrate_geo);
    assert_eq!(config.refresh.top_concepts, 3);
    assert_eq!(config.refresh.full_refresh_after_days, 7);
}

#[test]
fn missing_explicit_file_is_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, BiblioError::ConfigRead(ref missing) if *missing == path);
}

#[test]
fn invalid_json_is_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "{ \"scope\": ");
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(BiblioError::ConfigParse(_))
    );
}

#[test]
fn invalid_scope_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, r#"{"scope": {"institution": "A5023888391"}}"#);
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(BiblioError::InvalidInstitutionId(_))
    );

    let path = write_config(&dir, r#"{"scope": {"years": "2024-2001"}}"#);
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(BiblioError::InvalidYearRange(_))
    );
}

#[test]
fn environment_overrides_file_values() {
    let env = HashMap::from([
        ("OPENALEX_EMAIL", " team@example.org "),
        ("OPENALEX_API_KEY", ""),
        ("BIBLIO_ETL_DATA_DIR", "/srv/biblio"),
    ]);
    let mut config = Config::default();
    config.api.api_key = Some("from-file".to_string());

    let config = apply_env(config, |key| env.get(key).map(|value| value.to_string()));
    assert_eq!(config.api.mailto.as_deref(), Some("team@example.org"));
    assert_eq!(config.api.api_key.as_deref(), Some("from-file"));
    assert_eq!(config.store.data_dir.as_deref(), Some("/srv/biblio"));

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.store.data_dir, "/srv/biblio");
    assert_eq!(resolved.api.mailto.as_deref(), Some("team@example.org"));
}
