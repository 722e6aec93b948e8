use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};

use arrow_array::RecordBatch;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::config::StoreSettings;
use crate::domain::{QueryScope, SnapshotId, SnapshotSelector};
use crate::error::BiblioError;
use crate::openalex::RawWork;
use crate::schema::{self, Table};
use crate::transform::{TableCounts, TableSet};

pub const LATEST_FILE: &str = "LATEST";
pub const LOCK_FILE: &str = ".write.lock";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    FullRefresh,
    IncrementalRefresh,
    RawCache,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: SnapshotId,
    pub created_at: DateTime<Utc>,
    pub scope: QueryScope,
    pub origin: SnapshotOrigin,
    /// Snapshot this one was merged into or rebuilt from.
    #[serde(default)]
    pub base_snapshot: Option<SnapshotId>,
    #[serde(default)]
    pub counts: TableCounts,
    #[serde(default)]
    pub skipped_records: usize,
    #[serde(default)]
    pub dropped_authorships: usize,
    pub tool: String,
}

impl SnapshotManifest {
    pub fn new(snapshot_id: SnapshotId, scope: QueryScope, origin: SnapshotOrigin) -> Self {
        Self {
            created_at: snapshot_id.created_at(),
            snapshot_id,
            scope,
            origin,
            base_snapshot: None,
            counts: TableCounts::default(),
            skipped_records: 0,
            dropped_authorships: 0,
            tool: format!("biblio-etl {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub manifest: SnapshotManifest,
    pub tables: TableSet,
}

/// Held for the duration of a refresh. Removing the lock file on drop
/// releases it.
#[derive(Debug)]
pub struct WriteLock {
    path: Utf8PathBuf,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.path.as_std_path()) {
            warn!(path = %self.path, error = %err, "failed to release write lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self::new(settings.data_dir.clone())
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn snapshots_dir(&self) -> Utf8PathBuf {
        self.root.join("snapshots")
    }

    pub fn snapshot_dir(&self, id: &SnapshotId) -> Utf8PathBuf {
        self.snapshots_dir().join(id.as_str())
    }

    pub fn table_path(&self, id: &SnapshotId, table: Table) -> Utf8PathBuf {
        self.snapshot_dir(id).join(table.file_name())
    }

    pub fn raw_dir(&self) -> Utf8PathBuf {
        self.root.join("raw")
    }

    pub fn raw_path(&self, id: &SnapshotId) -> Utf8PathBuf {
        self.raw_dir().join(format!("{id}.jsonl.gz"))
    }

    /// Manifest of the run that fetched a raw cache, written next to it.
    pub fn raw_manifest_path(&self, id: &SnapshotId) -> Utf8PathBuf {
        self.raw_dir().join(format!("{id}.{MANIFEST_FILE}"))
    }

    pub fn latest_path(&self) -> Utf8PathBuf {
        self.root.join(LATEST_FILE)
    }

    pub fn lock_path(&self) -> Utf8PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn ensure_root(&self) -> Result<(), BiblioError> {
        fs::create_dir_all(self.root.as_std_path()).map_err(fs_err)
    }

    pub fn acquire_write_lock(&self) -> Result<WriteLock, BiblioError> {
        self.ensure_root()?;
        let path = self.lock_path();
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path.as_std_path())
                    .map(|content| content.trim().to_string())
                    .unwrap_or_default();
                return Err(BiblioError::WriteConflict(if holder.is_empty() {
                    path.to_string()
                } else {
                    format!("{path} ({holder})")
                }));
            }
            Err(err) => return Err(fs_err(err)),
        };
        let lock = WriteLock { path };
        writeln!(
            file,
            "pid={} acquired_at={}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )
        .map_err(fs_err)?;
        debug!(path = %lock.path, "acquired write lock");
        Ok(lock)
    }

    /// Removes a lock left behind by a process that is gone.
    pub fn force_unlock(&self) -> Result<bool, BiblioError> {
        let path = self.lock_path();
        if !path.as_std_path().exists() {
            return Ok(false);
        }
        fs::remove_file(path.as_std_path()).map_err(fs_err)?;
        warn!(path = %path, "removed write lock");
        Ok(true)
    }

    /// Writes a complete snapshot and points `LATEST` at it. Tables land in a
    /// staging directory first, so readers never see a partial snapshot.
    pub fn write(
        &self,
        tables: &TableSet,
        manifest: &SnapshotManifest,
    ) -> Result<Utf8PathBuf, BiblioError> {
        tables.validate()?;

        let id = &manifest.snapshot_id;
        let target = self.snapshot_dir(id);
        if target.as_std_path().exists() {
            return Err(BiblioError::WriteConflict(format!(
                "snapshot {id} already exists"
            )));
        }

        let snapshots = self.snapshots_dir();
        fs::create_dir_all(snapshots.as_std_path()).map_err(fs_err)?;
        let staging = Builder::new()
            .prefix(".staging-")
            .tempdir_in(snapshots.as_std_path())
            .map_err(fs_err)?;
        let staging_path = Utf8PathBuf::from_path_buf(staging.path().to_path_buf())
            .map_err(|_| BiblioError::Filesystem("invalid staging path".to_string()))?;

        for table in Table::ALL {
            let batch = table_batch(tables, table)?;
            write_parquet(&staging_path.join(table.file_name()), &batch)?;
        }

        let mut manifest = manifest.clone();
        manifest.counts = tables.counts();
        let content = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| BiblioError::Filesystem(err.to_string()))?;
        fs::write(staging_path.join(MANIFEST_FILE).as_std_path(), content).map_err(fs_err)?;

        fs::rename(staging_path.as_std_path(), target.as_std_path()).map_err(fs_err)?;
        self.set_latest(id)?;
        info!(snapshot = %id, works = manifest.counts.works, "snapshot written");
        Ok(target)
    }

    fn set_latest(&self, id: &SnapshotId) -> Result<(), BiblioError> {
        let mut temp = Builder::new()
            .prefix(".latest")
            .tempfile_in(self.root.as_std_path())
            .map_err(fs_err)?;
        temp.write_all(id.as_str().as_bytes()).map_err(fs_err)?;
        temp.persist(self.latest_path().as_std_path())
            .map_err(|err| BiblioError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Id in `LATEST`; falls back to the newest complete snapshot when the
    /// pointer is missing or stale.
    pub fn latest_id(&self) -> Result<Option<SnapshotId>, BiblioError> {
        let pointer = self.latest_path();
        if let Ok(content) = fs::read_to_string(pointer.as_std_path()) {
            match content.trim().parse::<SnapshotId>() {
                Ok(id) if self.is_complete(&id) => return Ok(Some(id)),
                Ok(id) => warn!(snapshot = %id, "LATEST points at a missing snapshot"),
                Err(err) => warn!(error = %err, "unreadable LATEST pointer"),
            }
        }
        Ok(self.list_snapshots()?.pop())
    }

    pub fn resolve(&self, selector: &SnapshotSelector) -> Result<SnapshotId, BiblioError> {
        match selector {
            SnapshotSelector::Latest => self
                .latest_id()?
                .ok_or_else(|| BiblioError::SnapshotNotFound("latest".to_string())),
            SnapshotSelector::Id(id) if self.is_complete(id) => Ok(id.clone()),
            SnapshotSelector::Id(id) => Err(BiblioError::SnapshotNotFound(id.to_string())),
        }
    }

    fn is_complete(&self, id: &SnapshotId) -> bool {
        self.snapshot_dir(id).join(MANIFEST_FILE).as_std_path().is_file()
    }

    pub fn read_manifest(&self, id: &SnapshotId) -> Result<SnapshotManifest, BiblioError> {
        let path = self.snapshot_dir(id).join(MANIFEST_FILE);
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| BiblioError::SnapshotNotFound(id.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|err| BiblioError::Filesystem(format!("manifest of {id}: {err}")))
    }

    pub fn read(&self, selector: &SnapshotSelector) -> Result<Snapshot, BiblioError> {
        let id = self.resolve(selector)?;
        let manifest = self.read_manifest(&id)?;
        let tables = TableSet {
            works: self
                .read_rows(&id, Table::Works, schema::works_from_batch)?
                .into_iter()
                .map(|row| (row.id.clone(), row))
                .collect(),
            authors: self
                .read_rows(&id, Table::Authors, schema::authors_from_batch)?
                .into_iter()
                .map(|row| (row.id.clone(), row))
                .collect(),
            institutions: self
                .read_rows(&id, Table::Institutions, schema::institutions_from_batch)?
                .into_iter()
                .map(|row| (row.id.clone(), row))
                .collect(),
            authorships: self.read_rows(&id, Table::Authorships, schema::authorships_from_batch)?,
            collaborations: self.read_rows(
                &id,
                Table::Collaborations,
                schema::collaborations_from_batch,
            )?,
            concepts: self.read_rows(&id, Table::Concepts, schema::concepts_from_batch)?,
            country_edges: self.read_rows(
                &id,
                Table::CountryEdges,
                schema::country_edges_from_batch,
            )?,
        };
        Ok(Snapshot { manifest, tables })
    }

    fn read_rows<T>(
        &self,
        id: &SnapshotId,
        table: Table,
        convert: fn(&RecordBatch) -> Result<Vec<T>, BiblioError>,
    ) -> Result<Vec<T>, BiblioError> {
        let file = self.open_table(id, table)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut rows = Vec::new();
        for batch in reader {
            rows.extend(convert(&batch?)?);
        }
        Ok(rows)
    }

    /// Reads only `columns` of one table.
    pub fn read_columns(
        &self,
        selector: &SnapshotSelector,
        table: Table,
        columns: &[&str],
    ) -> Result<Vec<RecordBatch>, BiblioError> {
        let id = self.resolve(selector)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(self.open_table(&id, table)?)?;
        let indices = columns
            .iter()
            .map(|name| {
                builder.schema().index_of(name).map_err(|_| {
                    BiblioError::SchemaMismatch(format!("table {table} has no column {name}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
        let reader = builder.with_projection(mask).build()?;
        Ok(reader.collect::<Result<Vec<_>, _>>()?)
    }

    fn open_table(&self, id: &SnapshotId, table: Table) -> Result<File, BiblioError> {
        let path = self.table_path(id, table);
        File::open(path.as_std_path())
            .map_err(|err| BiblioError::Parquet(format!("{path}: {err}")))
    }

    /// Complete snapshots, oldest first. Staging directories are skipped.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotId>, BiblioError> {
        let dir = self.snapshots_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir.as_std_path()).map_err(fs_err)? {
            let entry = entry.map_err(fs_err)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match name.parse::<SnapshotId>() {
                Ok(id) if self.is_complete(&id) => ids.push(id),
                Ok(_) => debug!(snapshot = name, "skipping snapshot without manifest"),
                Err(_) => debug!(entry = name, "skipping unrelated directory"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn list_manifests(&self) -> Result<Vec<SnapshotManifest>, BiblioError> {
        self.list_snapshots()?
            .iter()
            .map(|id| self.read_manifest(id))
            .collect()
    }

    /// Deletes all but the newest `keep` snapshots and their raw caches. The
    /// snapshot `LATEST` points at is always kept. Raw caches without a
    /// snapshot that are older than every kept snapshot are removed too.
    pub fn prune(&self, keep: usize) -> Result<Vec<SnapshotId>, BiblioError> {
        let ids = self.list_snapshots()?;
        let latest = self.latest_id()?;
        let keep = keep.max(1);
        let cutoff = ids.len().saturating_sub(keep);

        let mut removed = Vec::new();
        for id in ids.into_iter().take(cutoff) {
            if latest.as_ref() == Some(&id) {
                continue;
            }
            fs::remove_dir_all(self.snapshot_dir(&id).as_std_path()).map_err(fs_err)?;
            self.remove_raw(&id)?;
            info!(snapshot = %id, "pruned snapshot");
            removed.push(id);
        }

        let kept = self.list_snapshots()?;
        if let Some(oldest) = kept.first() {
            for id in self.list_raw()? {
                if &id < oldest && !kept.contains(&id) {
                    self.remove_raw(&id)?;
                    info!(raw = %id, "pruned orphaned raw cache");
                }
            }
        }
        Ok(removed)
    }

    /// Ids that have a raw cache file, oldest first.
    pub fn list_raw(&self) -> Result<Vec<SnapshotId>, BiblioError> {
        let dir = self.raw_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir.as_std_path()).map_err(fs_err)? {
            let entry = entry.map_err(fs_err)?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|name| name.strip_suffix(".jsonl.gz")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<SnapshotId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn remove_raw(&self, id: &SnapshotId) -> Result<(), BiblioError> {
        for path in [self.raw_path(id), self.raw_manifest_path(id)] {
            if path.as_std_path().exists() {
                fs::remove_file(path.as_std_path()).map_err(fs_err)?;
            }
        }
        Ok(())
    }

    /// Caches the raw records of a run as gzip JSON lines, together with the
    /// run's manifest so the cache can be re-transformed later.
    pub fn save_raw(
        &self,
        manifest: &SnapshotManifest,
        works: &[RawWork],
    ) -> Result<Utf8PathBuf, BiblioError> {
        let id = &manifest.snapshot_id;
        let dir = self.raw_dir();
        fs::create_dir_all(dir.as_std_path()).map_err(fs_err)?;
        let temp = Builder::new()
            .prefix(".raw")
            .tempfile_in(dir.as_std_path())
            .map_err(fs_err)?;
        {
            let mut encoder = GzEncoder::new(BufWriter::new(temp.as_file()), Compression::default());
            for work in works {
                serde_json::to_writer(&mut encoder, work)
                    .map_err(|err| BiblioError::Filesystem(err.to_string()))?;
                encoder.write_all(b"\n").map_err(fs_err)?;
            }
            encoder.finish().map_err(fs_err)?.flush().map_err(fs_err)?;
        }

        let mut meta = Builder::new()
            .prefix(".raw")
            .tempfile_in(dir.as_std_path())
            .map_err(fs_err)?;
        serde_json::to_writer_pretty(meta.as_file_mut(), manifest)
            .map_err(|err| BiblioError::Filesystem(err.to_string()))?;
        meta.persist(self.raw_manifest_path(id).as_std_path())
            .map_err(|err| BiblioError::Filesystem(err.to_string()))?;

        let path = self.raw_path(id);
        temp.persist(path.as_std_path())
            .map_err(|err| BiblioError::Filesystem(err.to_string()))?;
        debug!(path = %path, works = works.len(), "raw cache written");
        Ok(path)
    }

    /// Manifest of the run behind a raw cache. Caches written without one
    /// fall back to the snapshot's own manifest.
    pub fn load_raw_manifest(&self, id: &SnapshotId) -> Result<SnapshotManifest, BiblioError> {
        let path = self.raw_manifest_path(id);
        match fs::read_to_string(path.as_std_path()) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|err| BiblioError::SchemaMismatch(format!("{path}: {err}"))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => self
                .read_manifest(id)
                .map_err(|_| BiblioError::SnapshotNotFound(format!("manifest of raw cache {id}"))),
            Err(err) => Err(fs_err(err)),
        }
    }

    pub fn load_raw(&self, id: &SnapshotId) -> Result<Vec<RawWork>, BiblioError> {
        let path = self.raw_path(id);
        let file = File::open(path.as_std_path())
            .map_err(|_| BiblioError::SnapshotNotFound(format!("raw cache {id}")))?;
        let reader = BufReader::new(GzDecoder::new(file));
        let mut works = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(fs_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let work = serde_json::from_str(&line).map_err(|err| {
                BiblioError::SchemaMismatch(format!("{path} line {}: {err}", index + 1))
            })?;
            works.push(work);
        }
        Ok(works)
    }
}

fn table_batch(tables: &TableSet, table: Table) -> Result<RecordBatch, BiblioError> {
    match table {
        Table::Works => schema::works_batch(&tables.works.values().collect::<Vec<_>>()),
        Table::Authors => schema::authors_batch(&tables.authors.values().collect::<Vec<_>>()),
        Table::Institutions => {
            schema::institutions_batch(&tables.institutions.values().collect::<Vec<_>>())
        }
        Table::Authorships => schema::authorships_batch(&tables.authorships),
        Table::Collaborations => schema::collaborations_batch(&tables.collaborations),
        Table::Concepts => schema::concepts_batch(&tables.concepts),
        Table::CountryEdges => schema::country_edges_batch(&tables.country_edges),
    }
}

fn write_parquet(path: &Utf8Path, batch: &RecordBatch) -> Result<(), BiblioError> {
    let file = File::create(path.as_std_path()).map_err(fs_err)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn fs_err(err: io::Error) -> BiblioError {
    BiblioError::Filesystem(err.to_string())
}
