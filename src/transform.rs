//! Flattening of raw OpenAlex works into the normalized snapshot tables.
//!
//! [`flatten_work`] is pure: the same raw record always produces the same
//! rows. [`TableSet`] accumulates rows from many records and deduplicates
//! the entity tables by id.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{InstitutionId, short_id};
use crate::error::BiblioError;
use crate::openalex::{InstitutionGeo, RawConcept, RawWork};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkRow {
    pub id: String,
    pub title: Option<String>,
    pub publication_year: Option<i32>,
    pub publication_date: Option<String>,
    pub work_type: Option<String>,
    pub is_oa: Option<bool>,
    pub oa_status: Option<String>,
    pub cited_by_count: Option<i64>,
    pub author_count: i32,
    pub source_name: Option<String>,
    pub top_concept: Option<String>,
    pub concept_level: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorRow {
    pub id: String,
    pub display_name: Option<String>,
    pub orcid: Option<String>,
    /// Sorted, distinct institution ids seen on this author's authorships.
    pub institution_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstitutionRow {
    pub id: String,
    pub display_name: Option<String>,
    pub ror: Option<String>,
    pub country_code: Option<String>,
    pub institution_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorshipRow {
    pub work_id: String,
    pub author_id: String,
    pub institution_id: Option<String>,
    pub author_position: Option<String>,
    pub author_order: i32,
}

/// Undirected edge; `institution_a < institution_b`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollaborationRow {
    pub institution_a: String,
    pub institution_b: String,
    pub work_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConceptRow {
    pub work_id: String,
    pub concept_id: Option<String>,
    pub name: Option<String>,
    pub level: Option<i32>,
    pub score: Option<f64>,
    pub rank: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryEdgeRow {
    pub work_id: String,
    pub publication_year: Option<i32>,
    pub country_code: String,
    pub top_concept: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Excluded from country edges.
    pub home_institution: Option<InstitutionId>,
    pub top_concepts: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            home_institution: None,
            top_concepts: 5,
        }
    }
}

/// Rows produced by one raw work.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkRows {
    pub work: WorkRow,
    pub authors: Vec<AuthorRow>,
    pub institutions: Vec<InstitutionRow>,
    pub authorships: Vec<AuthorshipRow>,
    pub collaborations: Vec<CollaborationRow>,
    pub concepts: Vec<ConceptRow>,
    pub country_edges: Vec<CountryEdgeRow>,
    /// Authorships without an author id.
    pub dropped_authorships: usize,
}

pub fn flatten_work(raw: &RawWork, options: &TransformOptions) -> WorkRows {
    let work_id = short_id(&raw.id).to_string();

    let concepts = top_concepts(&raw.concepts, options.top_concepts)
        .into_iter()
        .enumerate()
        .map(|(index, concept)| ConceptRow {
            work_id: work_id.clone(),
            concept_id: concept.id.as_deref().map(|id| short_id(id).to_string()),
            name: concept.display_name.clone(),
            level: concept.level,
            score: concept.score,
            rank: index as i32 + 1,
        })
        .collect::<Vec<_>>();
    let top_concept = concepts.first().and_then(|concept| concept.name.clone());
    let concept_level = concepts.first().and_then(|concept| concept.level);

    let mut institutions = BTreeMap::<String, InstitutionRow>::new();
    let mut authors = BTreeMap::<String, AuthorRow>::new();
    let mut authorships = Vec::new();
    let mut dropped_authorships = 0usize;

    for (order, authorship) in raw.authorships.iter().enumerate() {
        let mut institution_ids = Vec::<String>::new();
        for institution in &authorship.institutions {
            let Some(id) = institution.id.as_deref() else {
                continue;
            };
            let id = short_id(id).to_string();
            let row = InstitutionRow {
                id: id.clone(),
                display_name: institution.display_name.clone(),
                ror: institution.ror.clone(),
                country_code: institution.country_code.clone(),
                institution_type: institution.institution_type.clone(),
                latitude: None,
                longitude: None,
            };
            institutions
                .entry(id.clone())
                .and_modify(|existing| existing.fill_from(&row))
                .or_insert(row);
            if !institution_ids.contains(&id) {
                institution_ids.push(id);
            }
        }

        let Some(author_id) = authorship
            .author
            .as_ref()
            .and_then(|author| author.id.as_deref())
            .map(|id| short_id(id).to_string())
        else {
            dropped_authorships += 1;
            continue;
        };
        let author = authorship.author.as_ref();
        let row = AuthorRow {
            id: author_id.clone(),
            display_name: author.and_then(|a| a.display_name.clone()),
            orcid: author.and_then(|a| a.orcid.clone()),
            institution_ids: sorted_distinct(institution_ids.iter().cloned()),
        };
        authors
            .entry(author_id.clone())
            .and_modify(|existing| existing.fill_from(&row))
            .or_insert(row);

        let position = authorship.author_position.clone();
        if institution_ids.is_empty() {
            authorships.push(AuthorshipRow {
                work_id: work_id.clone(),
                author_id,
                institution_id: None,
                author_position: position,
                author_order: order as i32,
            });
        } else {
            for institution_id in institution_ids {
                authorships.push(AuthorshipRow {
                    work_id: work_id.clone(),
                    author_id: author_id.clone(),
                    institution_id: Some(institution_id),
                    author_position: position.clone(),
                    author_order: order as i32,
                });
            }
        }
    }

    let institution_ids = institutions.keys().cloned().collect::<Vec<_>>();
    let collaborations = collaboration_pairs(&institution_ids)
        .into_iter()
        .map(|(a, b)| CollaborationRow {
            institution_a: a,
            institution_b: b,
            work_id: work_id.clone(),
        })
        .collect();

    let home = options.home_institution.as_ref().map(|id| id.as_str());
    let countries = institutions
        .values()
        .filter(|institution| Some(institution.id.as_str()) != home)
        .filter_map(|institution| institution.country_code.clone())
        .filter(|code| !code.trim().is_empty())
        .collect::<BTreeSet<_>>();
    let country_edges = countries
        .into_iter()
        .map(|country_code| CountryEdgeRow {
            work_id: work_id.clone(),
            publication_year: raw.publication_year,
            country_code,
            top_concept: top_concept.clone(),
        })
        .collect();

    let open_access = raw.open_access.as_ref();
    let work = WorkRow {
        id: work_id,
        title: raw.title.clone(),
        publication_year: raw.publication_year,
        publication_date: raw.publication_date.clone(),
        work_type: raw.work_type.clone(),
        is_oa: open_access.and_then(|oa| oa.is_oa),
        oa_status: open_access.and_then(|oa| oa.oa_status.clone()),
        cited_by_count: raw.cited_by_count,
        author_count: raw.authorships.len() as i32,
        source_name: raw
            .primary_location
            .as_ref()
            .and_then(|location| location.source.as_ref())
            .and_then(|source| source.display_name.clone()),
        top_concept,
        concept_level,
    };

    WorkRows {
        work,
        authors: authors.into_values().collect(),
        institutions: institutions.into_values().collect(),
        authorships,
        collaborations,
        concepts,
        country_edges,
        dropped_authorships,
    }
}

/// All unordered pairs of the distinct ids, each pair ordered `a < b`.
pub fn collaboration_pairs(ids: &[String]) -> Vec<(String, String)> {
    let distinct = sorted_distinct(ids.iter().cloned());
    let mut pairs = Vec::with_capacity(distinct.len() * distinct.len().saturating_sub(1) / 2);
    for (i, a) in distinct.iter().enumerate() {
        for b in &distinct[i + 1..] {
            pairs.push((a.clone(), b.clone()));
        }
    }
    pairs
}

fn top_concepts(concepts: &[RawConcept], limit: usize) -> Vec<&RawConcept> {
    let mut sorted = concepts.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| {
        let score_a = a.score.unwrap_or(0.0);
        let score_b = b.score.unwrap_or(0.0);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    sorted.truncate(limit);
    sorted
}

fn sorted_distinct<I: IntoIterator<Item = String>>(items: I) -> Vec<String> {
    items
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(other);
    }
}

impl AuthorRow {
    fn fill_from(&mut self, other: &AuthorRow) {
        fill(&mut self.display_name, &other.display_name);
        fill(&mut self.orcid, &other.orcid);
        self.institution_ids = sorted_distinct(
            self.institution_ids
                .drain(..)
                .chain(other.institution_ids.iter().cloned()),
        );
    }
}

impl InstitutionRow {
    fn fill_from(&mut self, other: &InstitutionRow) {
        fill(&mut self.display_name, &other.display_name);
        fill(&mut self.ror, &other.ror);
        fill(&mut self.country_code, &other.country_code);
        fill(&mut self.institution_type, &other.institution_type);
        fill(&mut self.latitude, &other.latitude);
        fill(&mut self.longitude, &other.longitude);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub works: usize,
    pub authors: usize,
    pub institutions: usize,
    pub authorships: usize,
    pub collaborations: usize,
    pub concepts: usize,
    pub country_edges: usize,
}

/// The full set of tables of one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSet {
    pub works: BTreeMap<String, WorkRow>,
    pub authors: BTreeMap<String, AuthorRow>,
    pub institutions: BTreeMap<String, InstitutionRow>,
    pub authorships: Vec<AuthorshipRow>,
    pub collaborations: Vec<CollaborationRow>,
    pub concepts: Vec<ConceptRow>,
    pub country_edges: Vec<CountryEdgeRow>,
}

impl TableSet {
    pub fn from_raw(works: &[RawWork], options: &TransformOptions) -> Self {
        let mut tables = Self::default();
        for raw in works {
            tables.push(flatten_work(raw, options));
        }
        tables
    }

    /// Adds one work's rows. A work id already present keeps its first rows.
    pub fn push(&mut self, rows: WorkRows) -> bool {
        if self.works.contains_key(&rows.work.id) {
            debug!(work = %rows.work.id, "duplicate work in listing; keeping first");
            return false;
        }
        for author in rows.authors {
            self.upsert_author(author, false);
        }
        for institution in rows.institutions {
            self.upsert_institution(institution, false);
        }
        self.authorships.extend(rows.authorships);
        self.collaborations.extend(rows.collaborations);
        self.concepts.extend(rows.concepts);
        self.country_edges.extend(rows.country_edges);
        self.works.insert(rows.work.id.clone(), rows.work);
        true
    }

    /// Incremental refresh: every work in `newer` replaces the same work in
    /// `previous` together with all of its per-work rows.
    pub fn merge_newer(previous: TableSet, newer: TableSet) -> TableSet {
        let replaced = newer.works.keys().cloned().collect::<HashSet<_>>();
        let keep = |work_id: &String| !replaced.contains(work_id);

        let mut merged = TableSet {
            works: previous
                .works
                .into_iter()
                .filter(|(id, _)| keep(id))
                .collect(),
            authors: previous.authors,
            institutions: previous.institutions,
            authorships: previous
                .authorships
                .into_iter()
                .filter(|row| keep(&row.work_id))
                .collect(),
            collaborations: previous
                .collaborations
                .into_iter()
                .filter(|row| keep(&row.work_id))
                .collect(),
            concepts: previous
                .concepts
                .into_iter()
                .filter(|row| keep(&row.work_id))
                .collect(),
            country_edges: previous
                .country_edges
                .into_iter()
                .filter(|row| keep(&row.work_id))
                .collect(),
        };

        for author in newer.authors.into_values() {
            merged.upsert_author(author, true);
        }
        for institution in newer.institutions.into_values() {
            merged.upsert_institution(institution, true);
        }
        merged.works.extend(newer.works);
        merged.authorships.extend(newer.authorships);
        merged.collaborations.extend(newer.collaborations);
        merged.concepts.extend(newer.concepts);
        merged.country_edges.extend(newer.country_edges);
        merged
    }

    fn upsert_author(&mut self, author: AuthorRow, prefer_new: bool) {
        match self.authors.get_mut(&author.id) {
            Some(existing) if prefer_new => {
                let mut updated = author;
                updated.fill_from(existing);
                *existing = updated;
            }
            Some(existing) => existing.fill_from(&author),
            None => {
                self.authors.insert(author.id.clone(), author);
            }
        }
    }

    fn upsert_institution(&mut self, institution: InstitutionRow, prefer_new: bool) {
        match self.institutions.get_mut(&institution.id) {
            Some(existing) if prefer_new => {
                let mut updated = institution;
                updated.fill_from(existing);
                *existing = updated;
            }
            Some(existing) => existing.fill_from(&institution),
            None => {
                self.institutions.insert(institution.id.clone(), institution);
            }
        }
    }

    pub fn apply_geo(&mut self, geos: &[InstitutionGeo]) -> usize {
        let mut updated = 0usize;
        for geo in geos {
            let Some(row) = self.institutions.get_mut(&geo.id) else {
                continue;
            };
            row.latitude = geo.latitude.or(row.latitude);
            row.longitude = geo.longitude.or(row.longitude);
            fill(&mut row.country_code, &geo.country_code);
            updated += 1;
        }
        updated
    }

    pub fn counts(&self) -> TableCounts {
        TableCounts {
            works: self.works.len(),
            authors: self.authors.len(),
            institutions: self.institutions.len(),
            authorships: self.authorships.len(),
            collaborations: self.collaborations.len(),
            concepts: self.concepts.len(),
            country_edges: self.country_edges.len(),
        }
    }

    /// Checks the referential invariants of a snapshot.
    pub fn validate(&self) -> Result<(), BiblioError> {
        for row in &self.authorships {
            if !self.works.contains_key(&row.work_id) {
                return Err(BiblioError::InvariantViolation(format!(
                    "authorship references missing work {}",
                    row.work_id
                )));
            }
            if !self.authors.contains_key(&row.author_id) {
                return Err(BiblioError::InvariantViolation(format!(
                    "authorship references missing author {}",
                    row.author_id
                )));
            }
        }
        for row in &self.collaborations {
            if row.institution_a == row.institution_b {
                return Err(BiblioError::InvariantViolation(format!(
                    "self-paired collaboration on {}",
                    row.work_id
                )));
            }
            for id in [&row.institution_a, &row.institution_b] {
                if !self.institutions.contains_key(id) {
                    return Err(BiblioError::InvariantViolation(format!(
                        "collaboration references missing institution {id}"
                    )));
                }
            }
        }
        let orphan = self
            .concepts
            .iter()
            .map(|row| &row.work_id)
            .chain(self.country_edges.iter().map(|row| &row.work_id))
            .chain(self.collaborations.iter().map(|row| &row.work_id))
            .find(|work_id| !self.works.contains_key(*work_id));
        if let Some(work_id) = orphan {
            return Err(BiblioError::InvariantViolation(format!(
                "row references missing work {work_id}"
            )));
        }
        Ok(())
    }
}
