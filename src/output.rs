use std::io::{self, Write};

use serde::Serialize;

use crate::domain::SnapshotId;
use crate::refresh::{ProgressEvent, ProgressSink, RefreshOutcome, RefreshSource};
use crate::store::SnapshotManifest;
use crate::summary::SnapshotSummary;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub latest: Option<SnapshotId>,
    pub snapshots: Vec<SnapshotManifest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub manifest: SnapshotManifest,
    pub summary: SnapshotSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneResult {
    pub kept: usize,
    pub removed: Vec<SnapshotId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnlockResult {
    pub removed: bool,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_refresh(result: &RefreshOutcome) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_prune(result: &PruneResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_unlock(result: &UnlockResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable output; progress goes to stderr so stdout stays clean.
pub struct ConsoleOutput;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

impl ConsoleOutput {
    pub fn print_refresh(result: &RefreshOutcome) {
        let (color, label) = match result.source {
            RefreshSource::Fresh => (GREEN, "new snapshot"),
            RefreshSource::Fallback => (YELLOW, "fallback to existing snapshot"),
        };
        println!("{CYAN}biblio-etl refresh{RESET}");
        println!("{color}{label}: {}{RESET}", result.snapshot_id);
        if let Some(reason) = &result.fallback_reason {
            println!("{YELLOW}  reason: {reason}{RESET}");
        }
        let states = result
            .states
            .iter()
            .map(|state| state.as_str())
            .collect::<Vec<_>>()
            .join(" -> ");
        println!("  states: {states}");
        if result.source == RefreshSource::Fresh {
            println!(
                "  pages: {}, skipped records: {}, dropped authorships: {}",
                result.pages, result.skipped_records, result.dropped_authorships
            );
        }
        let counts = &result.counts;
        println!(
            "  works: {}, authors: {}, institutions: {}, authorships: {}",
            counts.works, counts.authors, counts.institutions, counts.authorships
        );
        println!(
            "  collaborations: {}, concepts: {}, country edges: {}",
            counts.collaborations, counts.concepts, counts.country_edges
        );
        for id in &result.pruned {
            println!("  pruned {id}");
        }
    }

    pub fn print_list(result: &ListResult) {
        if result.snapshots.is_empty() {
            println!("no snapshots");
            return;
        }
        for manifest in &result.snapshots {
            let marker = if result.latest.as_ref() == Some(&manifest.snapshot_id) {
                format!("{GREEN}*{RESET}")
            } else {
                " ".to_string()
            };
            println!(
                "{marker} {}  {:?}  works={}  scope={}",
                manifest.snapshot_id,
                manifest.origin,
                manifest.counts.works,
                manifest.scope.filter()
            );
        }
    }

    pub fn print_info(result: &InfoResult) {
        let manifest = &result.manifest;
        let summary = &result.summary;
        println!("{CYAN}snapshot {}{RESET}", manifest.snapshot_id);
        println!("  created: {}", manifest.created_at.to_rfc3339());
        println!("  origin: {:?}", manifest.origin);
        if let Some(base) = &manifest.base_snapshot {
            println!("  base: {base}");
        }
        println!("  scope: {}", manifest.scope.filter());
        println!("  total publications: {}", summary.total_works);
        println!(
            "  citations: {} (mean {:.1} per work)",
            summary.total_citations, summary.mean_citations
        );
        println!("  open access: {:.1}%", summary.open_access_pct);
        println!(
            "  collaborating countries: {}, institutions: {}",
            summary.collaborating_countries, summary.collaborating_institutions
        );
        for year in &summary.per_year {
            println!(
                "    {}: {} works, {:.1} mean citations",
                year.year, year.works, year.mean_citations
            );
        }
        if !summary.top_types.is_empty() {
            let types = summary
                .top_types
                .iter()
                .map(|(kind, count)| format!("{kind} {count}"))
                .collect::<Vec<_>>()
                .join(", ");
            println!("  types: {types}");
        }
        if !summary.top_countries.is_empty() {
            let countries = summary
                .top_countries
                .iter()
                .map(|(code, count)| format!("{code} {count}"))
                .collect::<Vec<_>>()
                .join(", ");
            println!("  top countries: {countries}");
        }
        for discipline in &summary.disciplines {
            println!(
                "    {}: {} works, {:.1} mean citations, {:.1}% OA",
                discipline.concept,
                discipline.works,
                discipline.mean_citations,
                discipline.open_access_pct
            );
        }
    }

    pub fn print_prune(result: &PruneResult) {
        println!("kept {} snapshot(s), removed {}", result.kept, result.removed.len());
        for id in &result.removed {
            println!("  removed {id}");
        }
    }

    pub fn print_unlock(result: &UnlockResult) {
        if result.removed {
            println!("{YELLOW}write lock removed{RESET}");
        } else {
            println!("no write lock present");
        }
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("[{:>6.1}s] {}", elapsed.as_secs_f64(), event.message),
            None => eprintln!("{}", event.message),
        }
    }
}
