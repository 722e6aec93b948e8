use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::transform::{TableSet, WorkRow};

const TOP_N: usize = 10;
const TOP_DISCIPLINES: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearStats {
    pub year: i32,
    pub works: usize,
    pub mean_citations: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisciplineStats {
    pub concept: String,
    pub works: usize,
    pub mean_citations: f64,
    pub open_access_pct: f64,
    pub mean_authors: f64,
}

/// Headline figures of one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotSummary {
    pub total_works: usize,
    pub total_citations: i64,
    pub mean_citations: f64,
    pub open_access_pct: f64,
    pub collaborating_countries: usize,
    pub collaborating_institutions: usize,
    pub per_year: Vec<YearStats>,
    pub top_types: Vec<(String, usize)>,
    /// Countries by number of distinct co-authored works.
    pub top_countries: Vec<(String, usize)>,
    pub disciplines: Vec<DisciplineStats>,
}

impl SnapshotSummary {
    pub fn from_tables(tables: &TableSet) -> Self {
        let works = tables.works.values().collect::<Vec<_>>();
        let total_citations = works.iter().filter_map(|w| w.cited_by_count).sum();

        let mut by_year = BTreeMap::<i32, Vec<&WorkRow>>::new();
        for work in works.iter().copied() {
            if let Some(year) = work.publication_year {
                by_year.entry(year).or_default().push(work);
            }
        }
        let per_year = by_year
            .into_iter()
            .map(|(year, rows)| YearStats {
                year,
                works: rows.len(),
                mean_citations: mean_citations(&rows),
            })
            .collect();

        let mut types = HashMap::<String, usize>::new();
        for work in &works {
            let kind = work.work_type.clone().unwrap_or_else(|| "unknown".to_string());
            *types.entry(kind).or_default() += 1;
        }

        let mut country_works = HashMap::<&str, BTreeSet<&str>>::new();
        for edge in &tables.country_edges {
            country_works
                .entry(edge.country_code.as_str())
                .or_default()
                .insert(edge.work_id.as_str());
        }
        let collaborating_countries = country_works.len();
        let countries = country_works
            .into_iter()
            .map(|(code, ids)| (code.to_string(), ids.len()))
            .collect();

        let collaborating_institutions = tables
            .collaborations
            .iter()
            .flat_map(|row| [row.institution_a.as_str(), row.institution_b.as_str()])
            .collect::<BTreeSet<_>>()
            .len();

        let mut by_concept = HashMap::<&str, Vec<&WorkRow>>::new();
        for work in works.iter().copied() {
            if let Some(concept) = work.top_concept.as_deref() {
                by_concept.entry(concept).or_default().push(work);
            }
        }
        let mut disciplines = by_concept
            .into_iter()
            .map(|(concept, rows)| DisciplineStats {
                concept: concept.to_string(),
                works: rows.len(),
                mean_citations: mean_citations(&rows),
                open_access_pct: open_access_pct(&rows),
                mean_authors: round1(
                    rows.iter().map(|w| f64::from(w.author_count)).sum::<f64>() / rows.len() as f64,
                ),
            })
            .collect::<Vec<_>>();
        disciplines.sort_by(|a, b| b.works.cmp(&a.works).then_with(|| a.concept.cmp(&b.concept)));
        disciplines.truncate(TOP_DISCIPLINES);

        Self {
            total_works: works.len(),
            total_citations,
            mean_citations: mean_citations(&works),
            open_access_pct: open_access_pct(&works),
            collaborating_countries,
            collaborating_institutions,
            per_year,
            top_types: ranked(types),
            top_countries: ranked(countries),
            disciplines,
        }
    }
}

fn ranked(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut ranked = counts.into_iter().collect::<Vec<_>>();
    ranked.sort_by_key(|(name, count)| (Reverse(*count), name.clone()));
    ranked.truncate(TOP_N);
    ranked
}

/// Works without a citation count count as zero.
fn mean_citations(works: &[&WorkRow]) -> f64 {
    if works.is_empty() {
        return 0.0;
    }
    let total: i64 = works.iter().filter_map(|w| w.cited_by_count).sum();
    round1(total as f64 / works.len() as f64)
}

fn open_access_pct(works: &[&WorkRow]) -> f64 {
    let known = works.iter().filter_map(|w| w.is_oa).collect::<Vec<_>>();
    if known.is_empty() {
        return 0.0;
    }
    let open = known.iter().filter(|oa| **oa).count();
    round1(open as f64 * 100.0 / known.len() as f64)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
