//! Arrow schemas of the snapshot tables and conversions between table rows
//! and record batches.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, ListArray, RecordBatch,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use serde::Serialize;

use crate::error::BiblioError;
use crate::transform::{
    AuthorRow, AuthorshipRow, CollaborationRow, ConceptRow, CountryEdgeRow, InstitutionRow,
    WorkRow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Works,
    Authors,
    Institutions,
    Authorships,
    Collaborations,
    Concepts,
    CountryEdges,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Works,
        Table::Authors,
        Table::Institutions,
        Table::Authorships,
        Table::Collaborations,
        Table::Concepts,
        Table::CountryEdges,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Works => "works",
            Table::Authors => "authors",
            Table::Institutions => "institutions",
            Table::Authorships => "authorships",
            Table::Collaborations => "collaborations",
            Table::Concepts => "concepts",
            Table::CountryEdges => "country_edges",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.parquet", self.name())
    }

    pub fn schema(self) -> SchemaRef {
        match self {
            Table::Works => WORKS.clone(),
            Table::Authors => AUTHORS.clone(),
            Table::Institutions => INSTITUTIONS.clone(),
            Table::Authorships => AUTHORSHIPS.clone(),
            Table::Collaborations => COLLABORATIONS.clone(),
            Table::Concepts => CONCEPTS.clone(),
            Table::CountryEdges => COUNTRY_EDGES.clone(),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Table {
    type Err = BiblioError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|table| table.name() == value.trim())
            .ok_or_else(|| BiblioError::Parquet(format!("unknown table: {value}")))
    }
}

fn list_utf8() -> DataType {
    DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)))
}

static WORKS: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, true),
        Field::new("publication_year", DataType::Int32, true),
        Field::new("publication_date", DataType::Utf8, true),
        Field::new("work_type", DataType::Utf8, true),
        Field::new("is_oa", DataType::Boolean, true),
        Field::new("oa_status", DataType::Utf8, true),
        Field::new("cited_by_count", DataType::Int64, true),
        Field::new("author_count", DataType::Int32, false),
        Field::new("source_name", DataType::Utf8, true),
        Field::new("top_concept", DataType::Utf8, true),
        Field::new("concept_level", DataType::Int32, true),
    ]))
});

static AUTHORS: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("display_name", DataType::Utf8, true),
        Field::new("orcid", DataType::Utf8, true),
        Field::new("institution_ids", list_utf8(), true),
    ]))
});

static INSTITUTIONS: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("display_name", DataType::Utf8, true),
        Field::new("ror", DataType::Utf8, true),
        Field::new("country_code", DataType::Utf8, true),
        Field::new("institution_type", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
    ]))
});

static AUTHORSHIPS: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("work_id", DataType::Utf8, false),
        Field::new("author_id", DataType::Utf8, false),
        Field::new("institution_id", DataType::Utf8, true),
        Field::new("author_position", DataType::Utf8, true),
        Field::new("author_order", DataType::Int32, false),
    ]))
});

static COLLABORATIONS: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("institution_a", DataType::Utf8, false),
        Field::new("institution_b", DataType::Utf8, false),
        Field::new("work_id", DataType::Utf8, false),
    ]))
});

static CONCEPTS: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("work_id", DataType::Utf8, false),
        Field::new("concept_id", DataType::Utf8, true),
        Field::new("name", DataType::Utf8, true),
        Field::new("level", DataType::Int32, true),
        Field::new("score", DataType::Float64, true),
        Field::new("rank", DataType::Int32, false),
    ]))
});

static COUNTRY_EDGES: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("work_id", DataType::Utf8, false),
        Field::new("publication_year", DataType::Int32, true),
        Field::new("country_code", DataType::Utf8, false),
        Field::new("top_concept", DataType::Utf8, true),
    ]))
});

// === Rows -> RecordBatch ===

fn strings<'a, T: 'a>(rows: &'a [T], f: impl Fn(&'a T) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
}

fn opt_strings<'a, T: 'a>(rows: &'a [T], f: impl Fn(&'a T) -> Option<&'a str>) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
}

pub fn works_batch(rows: &[&WorkRow]) -> Result<RecordBatch, BiblioError> {
    let arrays: Vec<ArrayRef> = vec![
        strings(rows, |r| r.id.as_str()),
        opt_strings(rows, |r| r.title.as_deref()),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.publication_year).collect::<Vec<_>>(),
        )),
        opt_strings(rows, |r| r.publication_date.as_deref()),
        opt_strings(rows, |r| r.work_type.as_deref()),
        Arc::new(BooleanArray::from(
            rows.iter().map(|r| r.is_oa).collect::<Vec<_>>(),
        )),
        opt_strings(rows, |r| r.oa_status.as_deref()),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.cited_by_count).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.author_count).collect::<Vec<_>>(),
        )),
        opt_strings(rows, |r| r.source_name.as_deref()),
        opt_strings(rows, |r| r.top_concept.as_deref()),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.concept_level).collect::<Vec<_>>(),
        )),
    ];
    Ok(RecordBatch::try_new(Table::Works.schema(), arrays)?)
}

pub fn authors_batch(rows: &[&AuthorRow]) -> Result<RecordBatch, BiblioError> {
    let mut institution_ids = ListBuilder::new(StringBuilder::new());
    for row in rows {
        for id in &row.institution_ids {
            institution_ids.values().append_value(id);
        }
        institution_ids.append(true);
    }
    let arrays: Vec<ArrayRef> = vec![
        strings(rows, |r| r.id.as_str()),
        opt_strings(rows, |r| r.display_name.as_deref()),
        opt_strings(rows, |r| r.orcid.as_deref()),
        Arc::new(institution_ids.finish()),
    ];
    Ok(RecordBatch::try_new(Table::Authors.schema(), arrays)?)
}

pub fn institutions_batch(rows: &[&InstitutionRow]) -> Result<RecordBatch, BiblioError> {
    let arrays: Vec<ArrayRef> = vec![
        strings(rows, |r| r.id.as_str()),
        opt_strings(rows, |r| r.display_name.as_deref()),
        opt_strings(rows, |r| r.ror.as_deref()),
        opt_strings(rows, |r| r.country_code.as_deref()),
        opt_strings(rows, |r| r.institution_type.as_deref()),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.latitude).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.longitude).collect::<Vec<_>>(),
        )),
    ];
    Ok(RecordBatch::try_new(Table::Institutions.schema(), arrays)?)
}

pub fn authorships_batch(rows: &[AuthorshipRow]) -> Result<RecordBatch, BiblioError> {
    let arrays: Vec<ArrayRef> = vec![
        strings(rows, |r| r.work_id.as_str()),
        strings(rows, |r| r.author_id.as_str()),
        opt_strings(rows, |r| r.institution_id.as_deref()),
        opt_strings(rows, |r| r.author_position.as_deref()),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.author_order).collect::<Vec<_>>(),
        )),
    ];
    Ok(RecordBatch::try_new(Table::Authorships.schema(), arrays)?)
}

pub fn collaborations_batch(rows: &[CollaborationRow]) -> Result<RecordBatch, BiblioError> {
    let arrays: Vec<ArrayRef> = vec![
        strings(rows, |r| r.institution_a.as_str()),
        strings(rows, |r| r.institution_b.as_str()),
        strings(rows, |r| r.work_id.as_str()),
    ];
    Ok(RecordBatch::try_new(Table::Collaborations.schema(), arrays)?)
}

pub fn concepts_batch(rows: &[ConceptRow]) -> Result<RecordBatch, BiblioError> {
    let arrays: Vec<ArrayRef> = vec![
        strings(rows, |r| r.work_id.as_str()),
        opt_strings(rows, |r| r.concept_id.as_deref()),
        opt_strings(rows, |r| r.name.as_deref()),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.level).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.score).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.rank).collect::<Vec<_>>(),
        )),
    ];
    Ok(RecordBatch::try_new(Table::Concepts.schema(), arrays)?)
}

pub fn country_edges_batch(rows: &[CountryEdgeRow]) -> Result<RecordBatch, BiblioError> {
    let arrays: Vec<ArrayRef> = vec![
        strings(rows, |r| r.work_id.as_str()),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.publication_year).collect::<Vec<_>>(),
        )),
        strings(rows, |r| r.country_code.as_str()),
        opt_strings(rows, |r| r.top_concept.as_deref()),
    ];
    Ok(RecordBatch::try_new(Table::CountryEdges.schema(), arrays)?)
}

// === RecordBatch -> rows ===

fn column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a T, BiblioError> {
    batch
        .column_by_name(name)
        .and_then(|array| array.as_any().downcast_ref::<T>())
        .ok_or_else(|| BiblioError::Parquet(format!("column {name} missing or mistyped")))
}

fn opt_string(array: &StringArray, index: usize) -> Option<String> {
    array.is_valid(index).then(|| array.value(index).to_string())
}

fn opt_i32(array: &Int32Array, index: usize) -> Option<i32> {
    array.is_valid(index).then(|| array.value(index))
}

fn opt_f64(array: &Float64Array, index: usize) -> Option<f64> {
    array.is_valid(index).then(|| array.value(index))
}

fn string_list(array: &ListArray, index: usize) -> Result<Vec<String>, BiblioError> {
    if array.is_null(index) {
        return Ok(Vec::new());
    }
    let values = array.value(index);
    let values = values
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| BiblioError::Parquet("list column is not utf8".to_string()))?;
    Ok((0..values.len())
        .filter_map(|i| opt_string(values, i))
        .collect())
}

pub fn works_from_batch(batch: &RecordBatch) -> Result<Vec<WorkRow>, BiblioError> {
    let id = column::<StringArray>(batch, "id")?;
    let title = column::<StringArray>(batch, "title")?;
    let year = column::<Int32Array>(batch, "publication_year")?;
    let date = column::<StringArray>(batch, "publication_date")?;
    let work_type = column::<StringArray>(batch, "work_type")?;
    let is_oa = column::<BooleanArray>(batch, "is_oa")?;
    let oa_status = column::<StringArray>(batch, "oa_status")?;
    let cited = column::<Int64Array>(batch, "cited_by_count")?;
    let author_count = column::<Int32Array>(batch, "author_count")?;
    let source = column::<StringArray>(batch, "source_name")?;
    let concept = column::<StringArray>(batch, "top_concept")?;
    let level = column::<Int32Array>(batch, "concept_level")?;

    Ok((0..batch.num_rows())
        .map(|i| WorkRow {
            id: id.value(i).to_string(),
            title: opt_string(title, i),
            publication_year: opt_i32(year, i),
            publication_date: opt_string(date, i),
            work_type: opt_string(work_type, i),
            is_oa: is_oa.is_valid(i).then(|| is_oa.value(i)),
            oa_status: opt_string(oa_status, i),
            cited_by_count: cited.is_valid(i).then(|| cited.value(i)),
            author_count: author_count.value(i),
            source_name: opt_string(source, i),
            top_concept: opt_string(concept, i),
            concept_level: opt_i32(level, i),
        })
        .collect())
}

pub fn authors_from_batch(batch: &RecordBatch) -> Result<Vec<AuthorRow>, BiblioError> {
    let id = column::<StringArray>(batch, "id")?;
    let name = column::<StringArray>(batch, "display_name")?;
    let orcid = column::<StringArray>(batch, "orcid")?;
    let institution_ids = column::<ListArray>(batch, "institution_ids")?;

    (0..batch.num_rows())
        .map(|i| {
            Ok(AuthorRow {
                id: id.value(i).to_string(),
                display_name: opt_string(name, i),
                orcid: opt_string(orcid, i),
                institution_ids: string_list(institution_ids, i)?,
            })
        })
        .collect()
}

pub fn institutions_from_batch(batch: &RecordBatch) -> Result<Vec<InstitutionRow>, BiblioError> {
    let id = column::<StringArray>(batch, "id")?;
    let name = column::<StringArray>(batch, "display_name")?;
    let ror = column::<StringArray>(batch, "ror")?;
    let country = column::<StringArray>(batch, "country_code")?;
    let kind = column::<StringArray>(batch, "institution_type")?;
    let latitude = column::<Float64Array>(batch, "latitude")?;
    let longitude = column::<Float64Array>(batch, "longitude")?;

    Ok((0..batch.num_rows())
        .map(|i| InstitutionRow {
            id: id.value(i).to_string(),
            display_name: opt_string(name, i),
            ror: opt_string(ror, i),
            country_code: opt_string(country, i),
            institution_type: opt_string(kind, i),
            latitude: opt_f64(latitude, i),
            longitude: opt_f64(longitude, i),
        })
        .collect())
}

pub fn authorships_from_batch(batch: &RecordBatch) -> Result<Vec<AuthorshipRow>, BiblioError> {
    let work_id = column::<StringArray>(batch, "work_id")?;
    let author_id = column::<StringArray>(batch, "author_id")?;
    let institution_id = column::<StringArray>(batch, "institution_id")?;
    let position = column::<StringArray>(batch, "author_position")?;
    let order = column::<Int32Array>(batch, "author_order")?;

    Ok((0..batch.num_rows())
        .map(|i| AuthorshipRow {
            work_id: work_id.value(i).to_string(),
            author_id: author_id.value(i).to_string(),
            institution_id: opt_string(institution_id, i),
            author_position: opt_string(position, i),
            author_order: order.value(i),
        })
        .collect())
}

pub fn collaborations_from_batch(
    batch: &RecordBatch,
) -> Result<Vec<CollaborationRow>, BiblioError> {
    let a = column::<StringArray>(batch, "institution_a")?;
    let b = column::<StringArray>(batch, "institution_b")?;
    let work_id = column::<StringArray>(batch, "work_id")?;

    Ok((0..batch.num_rows())
        .map(|i| CollaborationRow {
            institution_a: a.value(i).to_string(),
            institution_b: b.value(i).to_string(),
            work_id: work_id.value(i).to_string(),
        })
        .collect())
}

pub fn concepts_from_batch(batch: &RecordBatch) -> Result<Vec<ConceptRow>, BiblioError> {
    let work_id = column::<StringArray>(batch, "work_id")?;
    let concept_id = column::<StringArray>(batch, "concept_id")?;
    let name = column::<StringArray>(batch, "name")?;
    let level = column::<Int32Array>(batch, "level")?;
    let score = column::<Float64Array>(batch, "score")?;
    let rank = column::<Int32Array>(batch, "rank")?;

    Ok((0..batch.num_rows())
        .map(|i| ConceptRow {
            work_id: work_id.value(i).to_string(),
            concept_id: opt_string(concept_id, i),
            name: opt_string(name, i),
            level: opt_i32(level, i),
            score: opt_f64(score, i),
            rank: rank.value(i),
        })
        .collect())
}

pub fn country_edges_from_batch(batch: &RecordBatch) -> Result<Vec<CountryEdgeRow>, BiblioError> {
    let work_id = column::<StringArray>(batch, "work_id")?;
    let year = column::<Int32Array>(batch, "publication_year")?;
    let country = column::<StringArray>(batch, "country_code")?;
    let concept = column::<StringArray>(batch, "top_concept")?;

    Ok((0..batch.num_rows())
        .map(|i| CountryEdgeRow {
            work_id: work_id.value(i).to_string(),
            publication_year: opt_i32(year, i),
            country_code: country.value(i).to_string(),
            top_concept: opt_string(concept, i),
        })
        .collect())
}
