//! Core domain model for factsync: feed items, normalized facts, stored rows and
//! the mutation batch handed from reconciliation to persistence.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "factsync-core";

/// One item of the remote feed, before any cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawFact {
    #[serde(default)]
    pub fact: String,
}

impl RawFact {
    pub fn new(fact: impl Into<String>) -> Self {
        Self { fact: fact.into() }
    }
}

/// Coarse content tag derived from a fact's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    NumberIncluded,
    NumberExcluded,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::NumberIncluded => "number_included",
            Category::NumberExcluded => "number_excluded",
        }
    }

    /// Parses the persisted column value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "number_included" => Some(Category::NumberIncluded),
            "number_excluded" => Some(Category::NumberExcluded),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strips everything except ASCII letters, ASCII digits and whitespace.
///
/// Casing, digits and the whitespace layout are preserved, so the function is
/// idempotent and never fails.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect()
}

pub fn classify(text: &str) -> Category {
    if text.chars().any(|c| c.is_ascii_digit()) {
        Category::NumberIncluded
    } else {
        Category::NumberExcluded
    }
}

/// A cleaned fact with its derived category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedFact {
    pub text: String,
    pub category: Category,
}

impl NormalizedFact {
    /// Builds a fact from already-normalized text; the category is always
    /// recomputed from `text`.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let category = classify(&text);
        Self { text, category }
    }

    pub fn from_raw(raw: &RawFact) -> Self {
        Self::new(normalize(&raw.fact))
    }
}

/// Persisted fact row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFact {
    pub text: String,
    pub category: Category,
    pub version: i32,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredFact {
    /// A freshly inserted row: version 1, active.
    pub fn inserted(text: impl Into<String>, category: Category, at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            category,
            version: 1,
            is_deleted: false,
            created_at: at,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactInsert {
    pub text: String,
    pub category: Category,
}

/// Overwrites the active row holding `matched_text` at `new_version - 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactUpdate {
    pub text: String,
    pub category: Category,
    pub new_version: i32,
    pub matched_text: String,
    pub similarity: f64,
}

impl FactUpdate {
    /// Version the matched row must still carry for the update to apply.
    pub fn expected_version(&self) -> i32 {
        self.new_version - 1
    }
}

/// All writes decided by one reconciliation run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MutationBatch {
    pub inserts: Vec<FactInsert>,
    pub updates: Vec<FactUpdate>,
    pub soft_deletes: Vec<String>,
}

impl MutationBatch {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.soft_deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.soft_deletes.len()
    }

    /// One update per matched row, keeping the last writer in batch order.
    ///
    /// A row is identified by its matched text and the version it must still
    /// carry. Rows keep the position of their first update so the write order
    /// stays close to the scan order.
    pub fn effective_updates(&self) -> Vec<&FactUpdate> {
        let mut slots: HashMap<(&str, i32), usize> = HashMap::new();
        let mut out: Vec<&FactUpdate> = Vec::new();
        for update in &self.updates {
            let row = (update.matched_text.as_str(), update.expected_version());
            match slots.get(&row) {
                Some(&idx) => out[idx] = update,
                None => {
                    slots.insert(row, out.len());
                    out.push(update);
                }
            }
        }
        out
    }
}
