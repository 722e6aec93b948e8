use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ApiSettings;
use crate::domain::QueryScope;
use crate::error::BiblioError;

/// Fields requested from `/works`; everything the transformer reads.
pub const WORK_SELECT: &str = "id,title,publication_year,publication_date,type,open_access,cited_by_count,concepts,authorships,primary_location";

const INSTITUTION_SELECT: &str = "id,country_code,geo";
const INSTITUTION_CHUNK: usize = 50;

/// Cursor that starts a fresh cursor-paged listing.
pub const START_CURSOR: &str = "*";

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWork {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub publication_year: Option<i32>,
    #[serde(default)]
    pub publication_date: Option<String>,
    #[serde(default, rename = "type")]
    pub work_type: Option<String>,
    #[serde(default)]
    pub open_access: Option<RawOpenAccess>,
    #[serde(default)]
    pub cited_by_count: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub authorships: Vec<RawAuthorship>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub concepts: Vec<RawConcept>,
    #[serde(default)]
    pub primary_location: Option<RawLocation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOpenAccess {
    #[serde(default)]
    pub is_oa: Option<bool>,
    #[serde(default)]
    pub oa_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAuthorship {
    #[serde(default)]
    pub author_position: Option<String>,
    #[serde(default)]
    pub author: Option<RawAuthor>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub institutions: Vec<RawInstitution>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAuthor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub orcid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInstitution {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub ror: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default, rename = "type")]
    pub institution_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawConcept {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub level: Option<i32>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLocation {
    #[serde(default)]
    pub source: Option<RawSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSource {
    #[serde(default)]
    pub display_name: Option<String>,
}

/// One decoded page of `/works`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorksPage {
    pub works: Vec<RawWork>,
    /// Elements of `results` that did not decode as a work.
    pub skipped: usize,
    pub next_cursor: Option<String>,
    pub total_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstitutionGeo {
    pub id: String,
    pub country_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

pub trait WorksClient: Send + Sync {
    fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: &str,
        per_page: u32,
    ) -> Result<WorksPage, BiblioError>;

    fn fetch_institutions(&self, ids: &[String]) -> Result<Vec<InstitutionGeo>, BiblioError>;
}

/// Decodes a `/works` response body. Elements that fail to decode are
/// skipped and counted rather than failing the page.
pub fn decode_page(body: Value) -> Result<WorksPage, BiblioError> {
    let Value::Object(mut map) = body else {
        return Err(BiblioError::SchemaMismatch(
            "works response is not a JSON object".to_string(),
        ));
    };
    let Some(Value::Array(results)) = map.remove("results") else {
        return Err(BiblioError::SchemaMismatch(
            "works response has no results array".to_string(),
        ));
    };
    let meta = map.remove("meta").unwrap_or(Value::Null);
    let next_cursor = meta
        .get("next_cursor")
        .and_then(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string());
    let total_count = meta.get("count").and_then(|value| value.as_u64());

    let mut works = Vec::with_capacity(results.len());
    let mut skipped = 0usize;
    for (index, item) in results.into_iter().enumerate() {
        let id_hint = item
            .get("id")
            .and_then(|value| value.as_str())
            .unwrap_or("<missing id>")
            .to_string();
        match serde_json::from_value::<RawWork>(item) {
            Ok(work) => works.push(work),
            Err(err) => {
                let mismatch = BiblioError::SchemaMismatch(format!("work {id_hint}: {err}"));
                warn!(index, error = %mismatch, "skipping work record");
                skipped += 1;
            }
        }
    }

    Ok(WorksPage {
        works,
        skipped,
        next_cursor,
        total_count,
    })
}

/// Decodes an `/institutions` response into geo rows.
pub fn decode_institutions(body: &Value) -> Result<Vec<InstitutionGeo>, BiblioError> {
    let results = body
        .get("results")
        .and_then(|value| value.as_array())
        .ok_or_else(|| {
            BiblioError::SchemaMismatch("institutions response has no results array".to_string())
        })?;
    let geos = results
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|value| value.as_str())?;
            let geo = item.get("geo");
            Some(InstitutionGeo {
                id: crate::domain::short_id(id).to_string(),
                country_code: item
                    .get("country_code")
                    .and_then(|value| value.as_str())
                    .or_else(|| {
                        geo.and_then(|g| g.get("country_code"))
                            .and_then(|value| value.as_str())
                    })
                    .map(|value| value.to_string()),
                latitude: geo
                    .and_then(|g| g.get("latitude"))
                    .and_then(|value| value.as_f64()),
                longitude: geo
                    .and_then(|g| g.get("longitude"))
                    .and_then(|value| value.as_f64()),
            })
        })
        .collect();
    Ok(geos)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, err: &BiblioError) -> Duration {
        if let BiblioError::RateLimited {
            retry_after_secs: Some(secs),
        } = err
        {
            return Duration::from_secs(*secs).min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
pub fn retry_with_backoff<T, S, F>(
    policy: &RetryPolicy,
    mut sleep: S,
    mut op: F,
) -> Result<T, BiblioError>
where
    S: FnMut(Duration),
    F: FnMut() -> Result<T, BiblioError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                if attempt >= max_attempts {
                    return Err(BiblioError::RetryExhausted {
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                let delay = policy.delay_for(attempt, &err);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying OpenAlex request"
                );
                sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Clone)]
pub struct OpenAlexHttpClient {
    client: Client,
    base_url: String,
    mailto: Option<String>,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl OpenAlexHttpClient {
    pub fn new(settings: &ApiSettings, retry: RetryPolicy) -> Result<Self, BiblioError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("biblio-etl/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BiblioError::NetworkTransient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| BiblioError::NetworkTransient(err.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            mailto: settings.mailto.clone(),
            api_key: settings.api_key.clone(),
            retry,
        })
    }

    fn auth_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(mailto) = &self.mailto {
            params.push(("mailto", mailto.clone()));
        }
        if let Some(api_key) = &self.api_key {
            params.push(("api_key", api_key.clone()));
        }
        params
    }

    fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, BiblioError> {
        let url = format!("{}/{}", self.base_url, path);
        let auth = self.auth_params();
        retry_with_backoff(&self.retry, thread::sleep, || {
            let response = self
                .client
                .get(&url)
                .query(query)
                .query(&auth)
                .send()
                .map_err(classify_error)?;
            let response = Self::handle_status(response)?;
            response.json::<Value>().map_err(|err| {
                if err.is_decode() {
                    BiblioError::SchemaMismatch(format!("{path} body: {err}"))
                } else {
                    BiblioError::NetworkTransient(err.to_string())
                }
            })
        })
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, BiblioError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            return Err(BiblioError::RateLimited { retry_after_secs });
        }
        if is_retryable_status(status) {
            return Err(BiblioError::NetworkTransient(format!(
                "OpenAlex returned status {status}"
            )));
        }
        let message = response
            .text()
            .unwrap_or_else(|_| "OpenAlex request failed".to_string());
        Err(BiblioError::ApiStatus { status, message })
    }
}

impl WorksClient for OpenAlexHttpClient {
    fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: &str,
        per_page: u32,
    ) -> Result<WorksPage, BiblioError> {
        let query = [
            ("filter", scope.filter()),
            ("select", WORK_SELECT.to_string()),
            ("per-page", per_page.to_string()),
            ("cursor", cursor.to_string()),
        ];
        let body = self.get_json("works", &query)?;
        decode_page(body)
    }

    fn fetch_institutions(&self, ids: &[String]) -> Result<Vec<InstitutionGeo>, BiblioError> {
        let mut geos = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(INSTITUTION_CHUNK) {
            let query = [
                ("filter", format!("openalex_id:{}", chunk.join("|"))),
                ("select", INSTITUTION_SELECT.to_string()),
                ("per-page", INSTITUTION_CHUNK.to_string()),
            ];
            let body = self.get_json("institutions", &query)?;
            geos.extend(decode_institutions(&body)?);
        }
        Ok(geos)
    }
}

/// Lazy cursor pager over `/works`. After an error it yields nothing more;
/// `cursor()` still points at the failed page so a new pager can resume there.
pub struct WorkPager<'a, C: WorksClient + ?Sized> {
    client: &'a C,
    scope: QueryScope,
    per_page: u32,
    cursor: Option<String>,
    pages: usize,
    failed: bool,
}

impl<'a, C: WorksClient + ?Sized> WorkPager<'a, C> {
    pub fn new(client: &'a C, scope: QueryScope, per_page: u32) -> Self {
        Self::resume(client, scope, per_page, START_CURSOR.to_string())
    }

    pub fn resume(client: &'a C, scope: QueryScope, per_page: u32, cursor: String) -> Self {
        Self {
            client,
            scope,
            per_page,
            cursor: Some(cursor),
            pages: 0,
            failed: false,
        }
    }

    /// Cursor of the next page to fetch; `None` once the listing is exhausted.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }
}

impl<C: WorksClient + ?Sized> Iterator for WorkPager<'_, C> {
    type Item = Result<WorksPage, BiblioError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let cursor = self.cursor.clone()?;
        match self.client.fetch_page(&self.scope, &cursor, self.per_page) {
            Ok(page) => {
                self.pages += 1;
                let drained = page.works.is_empty() && page.skipped == 0;
                self.cursor = if drained {
                    None
                } else {
                    page.next_cursor.clone()
                };
                debug!(
                    page = self.pages,
                    works = page.works.len(),
                    skipped = page.skipped,
                    "fetched works page"
                );
                Some(Ok(page))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn classify_error(err: reqwest::Error) -> BiblioError {
    if is_retryable_error(&err) {
        BiblioError::NetworkTransient(err.to_string())
    } else {
        BiblioError::ApiStatus {
            status: err.status().map(|status| status.as_u16()).unwrap_or(0),
            message: err.to_string(),
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}
