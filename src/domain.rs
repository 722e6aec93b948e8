use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BiblioError;

static INSTITUTION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[Ii](\d+)$").expect("static institution id pattern"));

const SNAPSHOT_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Strips the `https://openalex.org/` prefix from an entity URL.
pub fn short_id(url: &str) -> &str {
    url.trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(url)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstitutionId(String);

impl InstitutionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstitutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstitutionId {
    type Err = BiblioError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let captures = INSTITUTION_ID
            .captures(short_id(value))
            .ok_or_else(|| BiblioError::InvalidInstitutionId(value.to_string()))?;
        Ok(Self(format!("I{}", &captures[1])))
    }
}

impl TryFrom<String> for InstitutionId {
    type Error = BiblioError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstitutionId> for String {
    fn from(value: InstitutionId) -> Self {
        value.0
    }
}

/// Inclusive publication-year range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub from: i32,
    pub to: i32,
}

impl YearRange {
    pub fn new(from: i32, to: i32) -> Result<Self, BiblioError> {
        if from > to {
            return Err(BiblioError::InvalidYearRange(format!("{from}-{to}")));
        }
        Ok(Self { from, to })
    }
}

impl fmt::Display for YearRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

impl FromStr for YearRange {
    type Err = BiblioError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let parse_year = |s: &str| {
            s.trim()
                .parse::<i32>()
                .map_err(|_| BiblioError::InvalidYearRange(value.to_string()))
        };
        match trimmed.split_once('-') {
            Some((from, to)) => Self::new(parse_year(from)?, parse_year(to)?),
            None => {
                let year = parse_year(trimmed)?;
                Self::new(year, year)
            }
        }
    }
}

/// What one extraction run asks the API for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryScope {
    pub institution: InstitutionId,
    pub years: YearRange,
    #[serde(default)]
    pub updated_since: Option<NaiveDate>,
}

impl QueryScope {
    pub fn new(institution: InstitutionId, years: YearRange) -> Self {
        Self {
            institution,
            years,
            updated_since: None,
        }
    }

    pub fn with_updated_since(mut self, date: NaiveDate) -> Self {
        self.updated_since = Some(date);
        self
    }

    /// Value of the OpenAlex `filter` query parameter.
    pub fn filter(&self) -> String {
        let mut filter = format!(
            "authorships.institutions.id:{},publication_year:{}",
            self.institution, self.years
        );
        if let Some(date) = self.updated_since {
            filter.push_str(&format!(",from_updated_date:{}", date.format("%Y-%m-%d")));
        }
        filter
    }
}

/// Extraction timestamp of a snapshot, rendered as `YYYYMMDDTHHMMSSZ`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.format(SNAPSHOT_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(&self.0, SNAPSHOT_FORMAT)
            .map(|naive| naive.and_utc())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = BiblioError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        NaiveDateTime::parse_from_str(trimmed, SNAPSHOT_FORMAT)
            .map_err(|_| BiblioError::InvalidSnapshotId(value.to_string()))?;
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = BiblioError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SnapshotId> for String {
    fn from(value: SnapshotId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSelector {
    Latest,
    Id(SnapshotId),
}

impl fmt::Display for SnapshotSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotSelector::Latest => write!(f, "latest"),
            SnapshotSelector::Id(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for SnapshotSelector {
    type Err = BiblioError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "latest" => Ok(SnapshotSelector::Latest),
            other => Ok(SnapshotSelector::Id(other.parse()?)),
        }
    }
}
