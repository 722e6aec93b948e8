//! Refresh orchestration: extract, transform and persist one snapshot, or
//! fall back to the latest persisted snapshot when OpenAlex is unreachable.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{InstitutionId, QueryScope, SnapshotId, SnapshotSelector, short_id};
use crate::error::BiblioError;
use crate::openalex::{InstitutionGeo, RawWork, WorkPager, WorksClient};
use crate::store::{Snapshot, SnapshotManifest, SnapshotOrigin, Store};
use crate::transform::{TableCounts, TableSet, TransformOptions, flatten_work};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Extracting,
    Transforming,
    Persisting,
    Fallback,
    Done,
}

impl RefreshState {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshState::Idle => "idle",
            RefreshState::Extracting => "extracting",
            RefreshState::Transforming => "transforming",
            RefreshState::Persisting => "persisting",
            RefreshState::Fallback => "fallback",
            RefreshState::Done => "done",
        }
    }

    pub fn can_transition(self, next: RefreshState) -> bool {
        use RefreshState::*;
        matches!(
            (self, next),
            (Idle, Extracting)
                | (Idle, Fallback)
                | (Extracting, Transforming)
                | (Extracting, Fallback)
                | (Transforming, Persisting)
                | (Persisting, Done)
                | (Fallback, Done)
        )
    }
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States visited by one run, starting at `Idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTrail {
    states: Vec<RefreshState>,
}

impl Default for StateTrail {
    fn default() -> Self {
        Self {
            states: vec![RefreshState::Idle],
        }
    }
}

impl StateTrail {
    pub fn current(&self) -> RefreshState {
        self.states
            .last()
            .copied()
            .unwrap_or(RefreshState::Idle)
    }

    pub fn advance(&mut self, next: RefreshState) -> Result<(), BiblioError> {
        let current = self.current();
        if !current.can_transition(next) {
            return Err(BiblioError::InvalidState {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        info!(from = %current, to = %next, "refresh state");
        self.states.push(next);
        Ok(())
    }

    pub fn into_states(self) -> Vec<RefreshState> {
        self.states
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Full,
    Incremental,
    /// Incremental while the latest snapshot is younger than the configured
    /// full-refresh interval.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshSource {
    Fresh,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub snapshot_id: SnapshotId,
    pub source: RefreshSource,
    pub origin: SnapshotOrigin,
    pub states: Vec<RefreshState>,
    pub counts: TableCounts,
    pub pages: usize,
    pub skipped_records: usize,
    pub dropped_authorships: usize,
    pub geo_hydrated: usize,
    pub pruned: Vec<SnapshotId>,
    /// Why the run fell back, when it did.
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

struct Extraction {
    works: Vec<RawWork>,
    pages: usize,
    skipped: usize,
    geo: Vec<InstitutionGeo>,
}

pub struct Refresher<C: WorksClient> {
    store: Store,
    client: C,
    scope: QueryScope,
    per_page: u32,
    keep_snapshots: usize,
    full_refresh_after_days: i64,
    /// `from_updated_date` is only accepted from keyed clients.
    can_filter_updated: bool,
    hydrate_geo: bool,
    top_concepts: usize,
    clock: fn() -> DateTime<Utc>,
}

impl<C: WorksClient> Refresher<C> {
    pub fn new(store: Store, client: C, config: &ResolvedConfig) -> Self {
        Self {
            store,
            client,
            scope: config.scope.clone(),
            per_page: config.api.per_page,
            keep_snapshots: config.store.keep_snapshots,
            full_refresh_after_days: config.refresh.full_refresh_after_days,
            can_filter_updated: config.api.api_key.is_some(),
            hydrate_geo: config.refresh.hydrate_geo,
            top_concepts: config.refresh.top_concepts,
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn refresh(
        &self,
        mode: RefreshMode,
        sink: &dyn ProgressSink,
    ) -> Result<RefreshOutcome, BiblioError> {
        let _lock = self.store.acquire_write_lock()?;
        let started = Instant::now();
        let mut trail = StateTrail::default();

        let base = self.incremental_base(mode)?;
        let mut scope = self.scope.clone();
        if let Some(base) = &base {
            scope = scope.with_updated_since(base.manifest.created_at.date_naive());
        }
        let base_id = base
            .as_ref()
            .map(|snapshot| snapshot.manifest.snapshot_id.clone());
        let origin = if base.is_some() {
            SnapshotOrigin::IncrementalRefresh
        } else {
            SnapshotOrigin::FullRefresh
        };
        let snapshot_id = self.next_snapshot_id()?;
        info!(snapshot = %snapshot_id, filter = %scope.filter(), "refresh started");

        trail.advance(RefreshState::Extracting)?;
        let extraction = match self.extract(&scope, base.as_ref(), started, sink) {
            Ok(extraction) => extraction,
            Err(err @ BiblioError::RetryExhausted { .. }) => {
                return self.enter_fallback(trail, err, sink);
            }
            Err(err) => return Err(err),
        };
        let mut manifest = SnapshotManifest::new(snapshot_id.clone(), scope, origin);
        manifest.base_snapshot = base_id;
        manifest.skipped_records = extraction.skipped;
        self.store.save_raw(&manifest, &extraction.works)?;

        trail.advance(RefreshState::Transforming)?;
        sink.event(ProgressEvent {
            message: format!("phase=Transform; {} works", extraction.works.len()),
            elapsed: Some(started.elapsed()),
        });
        let (fresh, dropped_authorships) =
            self.build_tables(&extraction.works, &self.scope.institution);
        let mut tables = match base {
            Some(base) => TableSet::merge_newer(base.tables, fresh),
            None => fresh,
        };
        let geo_hydrated = tables.apply_geo(&extraction.geo);
        tables.validate()?;
        manifest.dropped_authorships = dropped_authorships;

        let pruned = self.persist(&mut trail, &tables, &manifest, started, sink)?;
        trail.advance(RefreshState::Done)?;

        Ok(RefreshOutcome {
            snapshot_id,
            source: RefreshSource::Fresh,
            origin,
            states: trail.into_states(),
            counts: tables.counts(),
            pages: extraction.pages,
            skipped_records: extraction.skipped,
            dropped_authorships,
            geo_hydrated,
            pruned,
            fallback_reason: None,
        })
    }

    /// Serves the latest snapshot without touching the network.
    pub fn fallback(&self, sink: &dyn ProgressSink) -> Result<RefreshOutcome, BiblioError> {
        let trail = StateTrail::default();
        self.enter_fallback(
            trail,
            BiblioError::NetworkTransient("fallback requested".to_string()),
            sink,
        )
    }

    /// Re-transforms a cached raw file into a new snapshot, using the scope
    /// of the run that fetched it. A cache from an incremental run only holds
    /// the changed works, so it is merged onto that run's base snapshot.
    pub fn rebuild_from_raw(
        &self,
        raw_id: &SnapshotId,
        sink: &dyn ProgressSink,
    ) -> Result<RefreshOutcome, BiblioError> {
        let _lock = self.store.acquire_write_lock()?;
        let started = Instant::now();
        let mut trail = StateTrail::default();

        trail.advance(RefreshState::Extracting)?;
        let raw_manifest = self.store.load_raw_manifest(raw_id)?;
        let works = self.store.load_raw(raw_id)?;
        sink.event(ProgressEvent {
            message: format!("phase=Extract; {} works from raw cache {raw_id}", works.len()),
            elapsed: Some(started.elapsed()),
        });
        let base = match raw_manifest.origin {
            SnapshotOrigin::IncrementalRefresh => Some(self.rebuild_base(raw_id, &raw_manifest)?),
            SnapshotOrigin::FullRefresh | SnapshotOrigin::RawCache => None,
        };
        let snapshot_id = self.next_snapshot_id()?;

        trail.advance(RefreshState::Transforming)?;
        let (fresh, dropped_authorships) =
            self.build_tables(&works, &raw_manifest.scope.institution);
        let mut tables = match base {
            Some(base) => TableSet::merge_newer(base.tables, fresh),
            None => fresh,
        };
        let geo_hydrated = tables.apply_geo(&self.stored_geo(raw_id)?);
        tables.validate()?;

        let mut manifest = SnapshotManifest::new(
            snapshot_id.clone(),
            raw_manifest.scope.clone(),
            SnapshotOrigin::RawCache,
        );
        manifest.base_snapshot = Some(raw_id.clone());
        manifest.skipped_records = raw_manifest.skipped_records;
        manifest.dropped_authorships = dropped_authorships;

        let pruned = self.persist(&mut trail, &tables, &manifest, started, sink)?;
        trail.advance(RefreshState::Done)?;

        Ok(RefreshOutcome {
            snapshot_id,
            source: RefreshSource::Fresh,
            origin: SnapshotOrigin::RawCache,
            states: trail.into_states(),
            counts: tables.counts(),
            pages: 0,
            skipped_records: raw_manifest.skipped_records,
            dropped_authorships,
            geo_hydrated,
            pruned,
            fallback_reason: None,
        })
    }

    fn rebuild_base(
        &self,
        raw_id: &SnapshotId,
        raw_manifest: &SnapshotManifest,
    ) -> Result<Snapshot, BiblioError> {
        let base_id = raw_manifest.base_snapshot.clone().ok_or_else(|| {
            BiblioError::InvariantViolation(format!(
                "raw cache {raw_id} is incremental but names no base snapshot"
            ))
        })?;
        match self.store.read(&SnapshotSelector::Id(base_id.clone())) {
            Err(BiblioError::SnapshotNotFound(_)) => Err(BiblioError::SnapshotNotFound(format!(
                "{base_id}, base of incremental raw cache {raw_id}"
            ))),
            other => other,
        }
    }

    /// Coordinates already hydrated into the snapshot built from `raw_id`.
    fn stored_geo(&self, raw_id: &SnapshotId) -> Result<Vec<InstitutionGeo>, BiblioError> {
        let snapshot = match self.store.read(&SnapshotSelector::Id(raw_id.clone())) {
            Ok(snapshot) => snapshot,
            Err(BiblioError::SnapshotNotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(snapshot
            .tables
            .institutions
            .into_values()
            .filter(|row| row.latitude.is_some() && row.longitude.is_some())
            .map(|row| InstitutionGeo {
                id: row.id,
                country_code: row.country_code,
                latitude: row.latitude,
                longitude: row.longitude,
            })
            .collect())
    }

    fn incremental_base(&self, mode: RefreshMode) -> Result<Option<Snapshot>, BiblioError> {
        let latest = self.store.latest_id()?;
        let incremental = match (mode, &latest) {
            (RefreshMode::Full, _) => false,
            (_, None) => {
                if mode == RefreshMode::Incremental {
                    warn!("no snapshot to update; running a full refresh");
                }
                false
            }
            (_, Some(_)) if !self.can_filter_updated => {
                if mode == RefreshMode::Incremental {
                    warn!("incremental refresh needs an OpenAlex API key; running a full refresh");
                } else {
                    debug!("no OpenAlex API key; auto mode runs a full refresh");
                }
                false
            }
            (RefreshMode::Incremental, Some(_)) => true,
            (RefreshMode::Auto, Some(id)) => {
                let age = (self.clock)() - id.created_at();
                age < TimeDelta::try_days(self.full_refresh_after_days).unwrap_or(TimeDelta::MAX)
            }
        };
        match latest {
            Some(id) if incremental => Ok(Some(self.store.read(&SnapshotSelector::Id(id))?)),
            _ => Ok(None),
        }
    }

    fn extract(
        &self,
        scope: &QueryScope,
        base: Option<&Snapshot>,
        started: Instant,
        sink: &dyn ProgressSink,
    ) -> Result<Extraction, BiblioError> {
        let mut works = Vec::new();
        let mut skipped = 0usize;
        let mut pager = WorkPager::new(&self.client, scope.clone(), self.per_page);
        while let Some(page) = pager.next() {
            let page = page?;
            skipped += page.skipped;
            works.extend(page.works);
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Extract; page {}; {} works",
                    pager.pages_fetched(),
                    works.len()
                ),
                elapsed: Some(started.elapsed()),
            });
        }
        let pages = pager.pages_fetched();
        if skipped > 0 {
            warn!(skipped, "records skipped on schema mismatch");
        }
        info!(pages, works = works.len(), "extraction finished");

        let geo = if self.hydrate_geo {
            let ids = institutions_to_hydrate(&works, base);
            if ids.is_empty() {
                Vec::new()
            } else {
                sink.event(ProgressEvent {
                    message: format!("phase=Extract; geo for {} institutions", ids.len()),
                    elapsed: Some(started.elapsed()),
                });
                self.client.fetch_institutions(&ids)?
            }
        } else {
            Vec::new()
        };

        Ok(Extraction {
            works,
            pages,
            skipped,
            geo,
        })
    }

    fn build_tables(&self, works: &[RawWork], home: &InstitutionId) -> (TableSet, usize) {
        let options = TransformOptions {
            home_institution: Some(home.clone()),
            top_concepts: self.top_concepts,
        };
        let mut tables = TableSet::default();
        let mut dropped = 0usize;
        for raw in works {
            let rows = flatten_work(raw, &options);
            dropped += rows.dropped_authorships;
            tables.push(rows);
        }
        (tables, dropped)
    }

    fn persist(
        &self,
        trail: &mut StateTrail,
        tables: &TableSet,
        manifest: &SnapshotManifest,
        started: Instant,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<SnapshotId>, BiblioError> {
        trail.advance(RefreshState::Persisting)?;
        sink.event(ProgressEvent {
            message: format!("phase=Persist; snapshot {}", manifest.snapshot_id),
            elapsed: Some(started.elapsed()),
        });
        self.store.write(tables, manifest)?;
        // The snapshot is committed; retention is best effort from here.
        match self.store.prune(self.keep_snapshots) {
            Ok(pruned) => Ok(pruned),
            Err(err) => {
                warn!(snapshot = %manifest.snapshot_id, error = %err, "pruning old snapshots failed");
                Ok(Vec::new())
            }
        }
    }

    fn enter_fallback(
        &self,
        mut trail: StateTrail,
        cause: BiblioError,
        sink: &dyn ProgressSink,
    ) -> Result<RefreshOutcome, BiblioError> {
        trail.advance(RefreshState::Fallback)?;
        warn!(error = %cause, "serving latest snapshot instead of fresh data");
        sink.event(ProgressEvent {
            message: format!("phase=Fallback; {cause}"),
            elapsed: None,
        });
        let snapshot = self.store.read(&SnapshotSelector::Latest)?;
        trail.advance(RefreshState::Done)?;

        let manifest = snapshot.manifest;
        Ok(RefreshOutcome {
            counts: snapshot.tables.counts(),
            snapshot_id: manifest.snapshot_id,
            source: RefreshSource::Fallback,
            origin: manifest.origin,
            states: trail.into_states(),
            pages: 0,
            skipped_records: 0,
            dropped_authorships: 0,
            geo_hydrated: 0,
            pruned: Vec::new(),
            fallback_reason: Some(cause.to_string()),
        })
    }

    /// Snapshot ids sort by time; a run within the same second as the latest
    /// snapshot is pushed one second past it.
    fn next_snapshot_id(&self) -> Result<SnapshotId, BiblioError> {
        let mut at = (self.clock)();
        if let Some(last) = self.store.list_snapshots()?.last() {
            let floor = last.created_at() + TimeDelta::seconds(1);
            if at < floor {
                at = floor;
            }
        }
        Ok(SnapshotId::from_timestamp(at))
    }
}

/// Institutions on `works` that have no coordinates yet in `base`.
fn institutions_to_hydrate(works: &[RawWork], base: Option<&Snapshot>) -> Vec<String> {
    let known = |id: &str| {
        base.and_then(|snapshot| snapshot.tables.institutions.get(id))
            .is_some_and(|row| row.latitude.is_some() && row.longitude.is_some())
    };
    works
        .iter()
        .flat_map(|work| &work.authorships)
        .flat_map(|authorship| &authorship.institutions)
        .filter_map(|institution| institution.id.as_deref())
        .map(|id| short_id(id).to_string())
        .filter(|id| !known(id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
