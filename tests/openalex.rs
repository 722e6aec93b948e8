use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::{Value, json};

use biblio_etl::domain::QueryScope;
use biblio_etl::error::BiblioError;
use biblio_etl::openalex::{
    InstitutionGeo, RetryPolicy, START_CURSOR, WorkPager, WorksClient, WorksPage, decode_page,
    retry_with_backoff,
};

fn fixture() -> Value {
    serde_json::from_str(include_str!("fixtures/works_page.json")).unwrap()
}

fn scope() -> QueryScope {
    QueryScope::new("I185261750".parse().unwrap(), "2020-2024".parse().unwrap())
}

#[test]
fn decode_fixture_skips_malformed_record() {
    let page = decode_page(fixture()).unwrap();
    assert_eq!(page.works.len(), 3);
    assert_eq!(page.skipped, 1);
    assert_eq!(page.next_cursor, None);
    assert_eq!(page.total_count, Some(4));

    let first = &page.works[0];
    assert_eq!(first.id, "https://openalex.org/W1001");
    assert_eq!(first.work_type.as_deref(), Some("article"));
    assert_eq!(first.authorships.len(), 3);
    assert!(first.authorships[2].author.is_none());

    let third = &page.works[2];
    assert_eq!(third.title, None);
    assert_eq!(third.cited_by_count, None);
    assert!(third.concepts.is_empty());
    assert!(third.authorships[0].institutions.is_empty());
}

#[test]
fn decode_rejects_non_object_body() {
    let err = decode_page(json!([1, 2, 3])).unwrap_err();
    assert_matches!(err, BiblioError::SchemaMismatch(_));
}

#[test]
fn retry_gives_up_after_max_attempts() {
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(15),
    };
    let sleeps = RefCell::new(Vec::new());
    let mut calls = 0;
    let result: Result<(), _> = retry_with_backoff(
        &policy,
        |delay| sleeps.borrow_mut().push(delay),
        || {
            calls += 1;
            Err(BiblioError::NetworkTransient("connection reset".to_string()))
        },
    );

    assert_matches!(
        result,
        Err(BiblioError::RetryExhausted { attempts: 3, ref last_error }) if last_error.contains("connection reset")
    );
    assert_eq!(calls, 3);
    assert_eq!(
        sleeps.into_inner(),
        vec![Duration::from_millis(10), Duration::from_millis(15)]
    );
}

#[test]
fn retry_recovers_from_rate_limit() {
    let policy = RetryPolicy::default();
    let mut sleeps = Vec::new();
    let mut calls = 0;
    let value = retry_with_backoff(
        &policy,
        |delay| sleeps.push(delay),
        || {
            calls += 1;
            if calls < 3 {
                Err(BiblioError::RateLimited {
                    retry_after_secs: Some(1),
                })
            } else {
                Ok("page")
            }
        },
    )
    .unwrap();

    assert_eq!(value, "page");
    assert_eq!(sleeps, vec![Duration::from_secs(1), Duration::from_secs(1)]);
}

#[test]
fn retry_does_not_repeat_client_errors() {
    let mut calls = 0;
    let result: Result<(), _> = retry_with_backoff(
        &RetryPolicy::default(),
        |_| panic!("must not sleep"),
        || {
            calls += 1;
            Err(BiblioError::ApiStatus {
                status: 400,
                message: "invalid filter".to_string(),
            })
        },
    );
    assert_matches!(result, Err(BiblioError::ApiStatus { status: 400, .. }));
    assert_eq!(calls, 1);
}

struct ScriptedClient {
    pages: Mutex<VecDeque<Result<WorksPage, BiblioError>>>,
    cursors: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new(pages: Vec<Result<WorksPage, BiblioError>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            cursors: Mutex::new(Vec::new()),
        }
    }
}

impl WorksClient for ScriptedClient {
    fn fetch_page(
        &self,
        _scope: &QueryScope,
        cursor: &str,
        _per_page: u32,
    ) -> Result<WorksPage, BiblioError> {
        self.cursors.lock().unwrap().push(cursor.to_string());
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(WorksPage::default()))
    }

    fn fetch_institutions(&self, _ids: &[String]) -> Result<Vec<InstitutionGeo>, BiblioError> {
        Ok(Vec::new())
    }
}

fn page_with_cursor(next: Option<&str>) -> WorksPage {
    let mut page = decode_page(fixture()).unwrap();
    page.next_cursor = next.map(str::to_string);
    page
}

#[test]
fn pager_follows_cursor_until_null() {
    let client = ScriptedClient::new(vec![
        Ok(page_with_cursor(Some("c2"))),
        Ok(page_with_cursor(Some("c3"))),
        Ok(page_with_cursor(None)),
    ]);
    let mut pager = WorkPager::new(&client, scope(), 200);
    let pages = pager.by_ref().collect::<Result<Vec<_>, _>>().unwrap();

    assert_eq!(pages.len(), 3);
    assert_eq!(pager.pages_fetched(), 3);
    assert_eq!(pager.cursor(), None);
    assert_eq!(
        *client.cursors.lock().unwrap(),
        vec![START_CURSOR.to_string(), "c2".to_string(), "c3".to_string()]
    );
}

#[test]
fn pager_stops_on_empty_page() {
    let client = ScriptedClient::new(vec![Ok(WorksPage {
        next_cursor: Some("c2".to_string()),
        ..WorksPage::default()
    })]);
    let pages = WorkPager::new(&client, scope(), 50).collect::<Vec<_>>();
    assert_eq!(pages.len(), 1);
    assert_eq!(client.cursors.lock().unwrap().len(), 1);
}

#[test]
fn pager_fuses_after_error_and_resumes() {
    let client = ScriptedClient::new(vec![
        Ok(page_with_cursor(Some("c2"))),
        Err(BiblioError::RetryExhausted {
            attempts: 5,
            last_error: "timeout".to_string(),
        }),
        Ok(page_with_cursor(None)),
    ]);
    let mut pager = WorkPager::new(&client, scope(), 200);
    assert!(pager.next().unwrap().is_ok());
    assert_matches!(pager.next(), Some(Err(BiblioError::RetryExhausted { .. })));
    assert!(pager.next().is_none());
    assert_eq!(pager.cursor(), Some("c2"));

    let cursor = pager.cursor().unwrap().to_string();
    let resumed = WorkPager::resume(&client, scope(), 200, cursor)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(client.cursors.lock().unwrap().last().unwrap(), "c2");
}

#[test]
fn scope_filter_includes_update_date() {
    let scope = scope().with_updated_since(chrono::NaiveDate::from_ymd_opt(2026, 10, 1).unwrap());
    assert_eq!(
        scope.filter(),
        "authorships.institutions.id:I185261750,publication_year:2020-2024,from_updated_date:2026-10-01"
    );
}
