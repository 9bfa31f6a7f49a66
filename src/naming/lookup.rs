//
// lookup.rs
// radifox
//
// Project look-up table: CSV loading, the in-memory description index and specificity matching.
//
// Thales Matheus Mendonça Santos - October 2026

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anonymize::hash_identifier;
use crate::error::{LookupError, NamingError};
use crate::storage::{canonical_json, sha256_hex};

pub const LUT_HEADER: [&str; 5] = [
    "Project",
    "Site",
    "InstitutionName",
    "SeriesDescription",
    "OutputFilename",
];

/// One row of the look-up table. Empty `site`/`institution_name` match anything.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LookupRow {
    #[serde(rename = "Project")]
    pub project: String,
    #[serde(rename = "Site", default)]
    pub site: String,
    #[serde(rename = "InstitutionName", default)]
    pub institution_name: String,
    #[serde(rename = "SeriesDescription")]
    pub series_description: String,
    #[serde(rename = "OutputFilename")]
    pub output_filename: String,
}

impl LookupRow {
    /// Number of optional columns pinned to a value.
    pub fn specificity(&self) -> usize {
        usize::from(!self.site.is_empty()) + usize::from(!self.institution_name.is_empty())
    }
}

/// A series' institution as recorded: the real name, or its one-way hash in
/// anonymized sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Institution<'a> {
    Plain(&'a str),
    Hashed(&'a str),
}

impl Institution<'_> {
    /// Exact comparison against an `InstitutionName` cell.
    pub fn matches(&self, cell: &str) -> bool {
        match self {
            Institution::Plain(name) => *name == cell,
            Institution::Hashed(hash) => hash_identifier(cell) == *hash,
        }
    }
}

/// Rows of one project (and site), indexed by exact series description.
#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    path: Option<PathBuf>,
    rows: Vec<LookupRow>,
    by_description: HashMap<String, Vec<usize>>,
}

impl LookupTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<LookupRow>, project: &str, site: Option<&str>) -> Self {
        let project = project.to_uppercase();
        let mut rows: Vec<LookupRow> = rows
            .into_iter()
            .map(|mut row| {
                row.project = row.project.trim().to_uppercase();
                row.site = row.site.trim().to_string();
                row.institution_name = row.institution_name.trim().to_string();
                row.output_filename = row.output_filename.trim().to_string();
                row
            })
            .filter(|row| row.project == project)
            .filter(|row| row.site.is_empty() || Some(row.site.as_str()) == site)
            .collect();
        rows.sort();
        rows.dedup();

        let mut by_description: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            by_description
                .entry(row.series_description.clone())
                .or_default()
                .push(idx);
        }
        Self {
            path: None,
            rows,
            by_description,
        }
    }

    /// Reads the table; a missing file yields an empty table without touching the disk.
    pub fn load(path: &Path, project: &str, site: Option<&str>) -> Result<Self, LookupError> {
        if !path.exists() {
            let mut table = Self::empty();
            table.path = Some(path.to_path_buf());
            return Ok(table);
        }
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::Headers)
            .from_path(path)
            .map_err(|source| LookupError::Csv {
                path: path.to_path_buf(),
                source,
            })?;

        let headers = reader.headers().map_err(|source| LookupError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        for column in LUT_HEADER {
            if !headers.iter().any(|h| h == column) {
                return Err(LookupError::MissingColumn {
                    path: path.to_path_buf(),
                    column,
                });
            }
        }

        let rows = reader
            .deserialize::<LookupRow>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| LookupError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
        let mut table = Self::from_rows(rows, project, site);
        table.path = Some(path.to_path_buf());
        Ok(table)
    }

    /// Like [`LookupTable::load`], but writes an empty table with the header row when absent.
    pub fn load_or_create(
        path: &Path,
        project: &str,
        site: Option<&str>,
    ) -> Result<Self, LookupError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut writer = csv::Writer::from_path(path).map_err(|source| LookupError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            writer
                .write_record(LUT_HEADER)
                .map_err(|source| LookupError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?;
            writer.flush()?;
            info!("Created empty look-up table at {:?}", path);
        }
        Self::load(path, project, site)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn rows(&self) -> &[LookupRow] {
        &self.rows
    }

    /// Content fingerprint of the rows that apply to this project and site.
    pub fn fingerprint(&self) -> String {
        let canonical = canonical_json(&self.rows).unwrap_or_default();
        sha256_hex(canonical.as_bytes())
    }

    /// Most specific row for this description and institution.
    ///
    /// Rows tied at the highest specificity with differing outputs are ambiguous.
    pub fn find(
        &self,
        description: &str,
        institution: Option<Institution<'_>>,
    ) -> Result<Option<&LookupRow>, NamingError> {
        let Some(indices) = self.by_description.get(description) else {
            return Ok(None);
        };
        let candidates: Vec<&LookupRow> = indices
            .iter()
            .map(|&idx| &self.rows[idx])
            .filter(|row| {
                row.institution_name.is_empty()
                    || institution.map_or(false, |inst| inst.matches(&row.institution_name))
            })
            .collect();
        let Some(best) = candidates.iter().map(|row| row.specificity()).max() else {
            return Ok(None);
        };
        let top: Vec<&LookupRow> = candidates
            .into_iter()
            .filter(|row| row.specificity() == best)
            .collect();
        let first = top[0];
        if top.iter().any(|row| row.output_filename != first.output_filename) {
            return Err(NamingError::Ambiguous {
                description: description.to_string(),
                candidates: top.len(),
            });
        }
        Ok(Some(first))
    }
}
