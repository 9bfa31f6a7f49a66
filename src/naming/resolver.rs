use std::collections::{BTreeMap, HashSet};

use crate::config::ExtrasMode;
use crate::context::StageContext;
use crate::error::NamingError;
use crate::naming::lookup::{Institution, LookupRow, LookupTable};
use crate::naming::manual::ManualNames;
use crate::naming::{Name, Override};

/// The attributes of a series the override layers match on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeriesQuery<'a> {
    pub description: Option<&'a str>,
    pub institution: Option<Institution<'a>>,
    pub source_path: Option<&'a str>,
}

/// Final name plus a record of which layers fired.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub name: Name,
    pub lookup_name: Option<Override>,
    pub manual_name: Option<Override>,
    pub lookup_rows: Vec<LookupRow>,
    pub manual_entries: BTreeMap<String, String>,
    pub warnings: Vec<NamingError>,
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, ctx: &StageContext, predicted: &Name, query: &SeriesQuery<'_>) -> Resolution;
}

/// predicted < look-up table < manual naming.
#[derive(Debug, Clone)]
pub struct LayeredResolver {
    lookup: LookupTable,
    manual: ManualNames,
    extras_mode: ExtrasMode,
}

impl LayeredResolver {
    pub fn new(lookup: LookupTable, manual: ManualNames, extras_mode: ExtrasMode) -> Self {
        Self {
            lookup,
            manual,
            extras_mode,
        }
    }

    pub fn lookup(&self) -> &LookupTable {
        &self.lookup
    }

    pub fn manual(&self) -> &ManualNames {
        &self.manual
    }
}

impl Resolver for LayeredResolver {
    fn resolve(&self, ctx: &StageContext, predicted: &Name, query: &SeriesQuery<'_>) -> Resolution {
        let mut resolution = Resolution {
            name: predicted.clone(),
            lookup_name: None,
            manual_name: None,
            lookup_rows: Vec::new(),
            manual_entries: BTreeMap::new(),
            warnings: Vec::new(),
        };

        if let Some(description) = query.description {
            match self.lookup.find(description, query.institution) {
                Ok(Some(row)) => match row.output_filename.parse::<Override>() {
                    Ok(over) => {
                        resolution.name = resolution.name.apply(&over, self.extras_mode);
                        resolution.lookup_name = Some(over);
                        resolution.lookup_rows.push(row.clone());
                    }
                    Err(err) => {
                        ctx.warn(&format!("ignoring look-up row: {}", err));
                        resolution.warnings.push(err);
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    ctx.warn(&format!("{}; keeping automatic name", err));
                    resolution.warnings.push(err);
                }
            }
        }

        if let Some(source_path) = query.source_path {
            if let Some(raw) = self.manual.get(source_path) {
                resolution
                    .manual_entries
                    .insert(source_path.to_string(), raw.to_string());
                match raw.parse::<Override>() {
                    Ok(over) => {
                        resolution.name = resolution.name.apply(&over, self.extras_mode);
                        resolution.manual_name = Some(over);
                    }
                    Err(err) => {
                        ctx.warn(&format!("ignoring manual name: {}", err));
                        resolution.warnings.push(err);
                    }
                }
            }
        }

        resolution
    }
}

/// Names already assigned in a session; later duplicates get a numeric extra.
#[derive(Debug, Default)]
pub struct NameRegistry {
    used: HashSet<String>,
}

impl NameRegistry {
    pub fn claim(&mut self, name: Name) -> Name {
        if self.used.insert(name.render()) {
            return name;
        }
        let mut counter = 2;
        loop {
            let mut candidate = name.clone();
            candidate.push_extra(counter.to_string());
            if self.used.insert(candidate.render()) {
                return candidate;
            }
            counter += 1;
        }
    }
}
