//
// mod.rs
// radifox
//
// Structured series names, positional overrides and the merge rule that layers them.
//
// Thales Matheus Mendonça Santos - October 2026

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ExtrasMode;
use crate::error::NamingError;

pub mod classifier;
pub mod lookup;
pub mod manual;
pub mod predictor;
pub mod resolver;

/// Version stamp of the naming rules; a change forces `update` to re-resolve every session.
pub const NAMING_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of fixed positional slots in every name.
pub const SLOT_COUNT: usize = 6;

/// Token that marks an inherited slot in override strings.
pub const INHERIT_TOKEN: &str = "None";

/// Semantic meaning of each positional slot, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    BodyPart = 0,
    Modality = 1,
    Technique = 2,
    Plane = 3,
    Contrast = 4,
    Variant = 5,
}

/// Fully resolved name: six slots (possibly empty) plus free-form extras.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "Vec<Option<String>>", try_from = "Vec<Option<String>>")]
pub struct Name {
    slots: [Option<String>; SLOT_COUNT],
    extras: Vec<String>,
}

impl Name {
    pub fn new(slots: [Option<String>; SLOT_COUNT], extras: Vec<String>) -> Self {
        Self { slots, extras }
    }

    pub fn slot(&self, slot: Slot) -> Option<&str> {
        self.slots[slot as usize].as_deref()
    }

    pub fn slots(&self) -> &[Option<String>; SLOT_COUNT] {
        &self.slots
    }

    pub fn extras(&self) -> &[String] {
        &self.extras
    }

    pub fn push_extra(&mut self, extra: impl Into<String>) {
        self.extras.push(extra.into());
    }

    /// Layer `over` on top of this name. Only explicit slots below the override's
    /// length are replaced; extras follow `mode`.
    pub fn apply(&self, over: &Override, mode: ExtrasMode) -> Name {
        let mut merged = self.clone();
        for (idx, slot) in over.slots.iter().enumerate() {
            if let OverrideSlot::Set(value) = slot {
                merged.slots[idx] = Some(value.clone());
            }
        }
        if let Some(extras) = &over.extras {
            match mode {
                ExtrasMode::Replace => merged.extras = extras.clone(),
                ExtrasMode::Append => merged.extras.extend(extras.iter().cloned()),
            }
        }
        merged
    }

    /// File-name stem component: present slots then extras, dash separated.
    pub fn render(&self) -> String {
        self.slots
            .iter()
            .flatten()
            .chain(self.extras.iter())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<Name> for Vec<Option<String>> {
    fn from(name: Name) -> Self {
        name.slots
            .into_iter()
            .chain(name.extras.into_iter().map(Some))
            .collect()
    }
}

impl TryFrom<Vec<Option<String>>> for Name {
    type Error = String;

    fn try_from(values: Vec<Option<String>>) -> Result<Self, Self::Error> {
        if values.len() < SLOT_COUNT {
            return Err(format!(
                "name needs {} slots, found {}",
                SLOT_COUNT,
                values.len()
            ));
        }
        let mut iter = values.into_iter();
        let mut slots: [Option<String>; SLOT_COUNT] = Default::default();
        for slot in slots.iter_mut() {
            *slot = iter.next().flatten();
        }
        Ok(Name {
            slots,
            extras: iter.flatten().collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideSlot {
    Inherit,
    Set(String),
}

/// Partial name applied positionally from slot 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<Option<String>>", try_from = "Vec<Option<String>>")]
pub struct Override {
    slots: Vec<OverrideSlot>,
    extras: Option<Vec<String>>,
}

impl Override {
    pub fn slots(&self) -> &[OverrideSlot] {
        &self.slots
    }

    pub fn extras(&self) -> Option<&[String]> {
        self.extras.as_deref()
    }

    /// True when applying this override cannot change any name.
    pub fn is_noop(&self) -> bool {
        self.extras.is_none() && self.slots.iter().all(|s| *s == OverrideSlot::Inherit)
    }

    fn from_tokens(tokens: Vec<Option<String>>) -> Self {
        let mut iter = tokens.into_iter();
        let slots: Vec<OverrideSlot> = iter
            .by_ref()
            .take(SLOT_COUNT)
            .map(|token| match token {
                Some(value) => OverrideSlot::Set(value),
                None => OverrideSlot::Inherit,
            })
            .collect();
        let extras: Vec<String> = iter.flatten().collect();
        Override {
            slots,
            extras: if extras.is_empty() { None } else { Some(extras) },
        }
    }
}

impl FromStr for Override {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(NamingError::InvalidOverride(s.to_string()));
        }
        let tokens = trimmed
            .split('-')
            .map(|token| {
                let token = token.trim();
                if token.is_empty() || token == INHERIT_TOKEN {
                    None
                } else {
                    Some(token.to_string())
                }
            })
            .collect();
        Ok(Override::from_tokens(tokens))
    }
}

impl fmt::Display for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = self
            .slots
            .iter()
            .map(|slot| match slot {
                OverrideSlot::Inherit => INHERIT_TOKEN,
                OverrideSlot::Set(value) => value.as_str(),
            })
            .collect();
        if let Some(extras) = &self.extras {
            while parts.len() < SLOT_COUNT {
                parts.push(INHERIT_TOKEN);
            }
            parts.extend(extras.iter().map(|e| e.as_str()));
        }
        f.write_str(&parts.join("-"))
    }
}

impl From<Override> for Vec<Option<String>> {
    fn from(over: Override) -> Self {
        let mut values: Vec<Option<String>> = over
            .slots
            .into_iter()
            .map(|slot| match slot {
                OverrideSlot::Inherit => None,
                OverrideSlot::Set(value) => Some(value),
            })
            .collect();
        if let Some(extras) = over.extras {
            values.resize(SLOT_COUNT, None);
            values.extend(extras.into_iter().map(Some));
        }
        values
    }
}

impl TryFrom<Vec<Option<String>>> for Override {
    type Error = String;

    fn try_from(values: Vec<Option<String>>) -> Result<Self, Self::Error> {
        Ok(Override::from_tokens(values))
    }
}
