//! Append-only store of completed patterns

use std::collections::HashMap;

use crate::pattern::{CompletedPattern, PatternId, PatternKey, PatternStages};
use crate::SeriesId;

/// Completed records in insertion order. Records are never modified once stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedArchive {
    records: Vec<CompletedPattern>,
    index: HashMap<PatternId, usize>,
}

impl CompletedArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Returns false when a record with the same id is already stored.
    pub fn push(&mut self, record: CompletedPattern) -> bool {
        let id = record.id();
        if self.index.contains_key(&id) {
            tracing::debug!(pattern = %id, "duplicate completed record ignored");
            return false;
        }
        self.index.insert(id, self.records.len());
        self.records.push(record);
        true
    }

    /// Append many records, returning how many were new
    pub fn extend<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = CompletedPattern>,
    {
        records.into_iter().map(|r| self.push(r)).filter(|&added| added).count()
    }

    pub fn get(&self, id: &PatternId) -> Option<&CompletedPattern> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn contains(&self, id: &PatternId) -> bool {
        self.index.contains_key(id)
    }

    pub fn for_series(&self, series_id: SeriesId) -> impl Iterator<Item = &CompletedPattern> {
        self.records.iter().filter(move |r| r.series_id == series_id)
    }

    pub fn for_key(&self, key: PatternKey) -> impl Iterator<Item = &CompletedPattern> {
        self.records.iter().filter(move |r| r.key() == key)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CompletedPattern> {
        self.records.iter()
    }

    pub fn as_slice(&self) -> &[CompletedPattern] {
        &self.records
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<'a> IntoIterator for &'a CompletedArchive {
    type Item = &'a CompletedPattern;
    type IntoIter = std::slice::Iter<'a, CompletedPattern>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
