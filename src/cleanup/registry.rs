use std::collections::HashSet;

use crate::core::types::{is_system_column, OCCUPIED_BY, ROW_ID};
use crate::core::{Result, TdmError};
use crate::result::QueryResult;

/// In-process cleanup strategy selected by name from a [`CleanerRegistry`].
pub trait TableCleaner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ids of the snapshot rows to remove.
    fn select_removals(&self, snapshot: &QueryResult) -> Result<Vec<String>>;
}

/// Registered cleanup strategies. Only names registered here can be run;
/// there is no other way to resolve a strategy from a string.
pub struct CleanerRegistry {
    cleaners: Vec<Box<dyn TableCleaner>>,
}

impl CleanerRegistry {
    pub fn new() -> Self {
        Self {
            cleaners: Vec::new(),
        }
    }

    /// Registering a name twice replaces the earlier strategy.
    pub fn register(&mut self, cleaner: Box<dyn TableCleaner>) {
        self.cleaners.retain(|c| c.name() != cleaner.name());
        self.cleaners.push(cleaner);
    }

    pub fn with_default_cleaners() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DuplicateRowsCleaner));
        registry.register(Box::new(OccupiedRowsCleaner));
        registry
    }

    pub fn get(&self, name: &str) -> Result<&dyn TableCleaner> {
        self.cleaners
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
            .ok_or_else(|| {
                TdmError::Validation(format!(
                    "unknown cleanup class '{}', registered: {}",
                    name,
                    self.list_cleaners().join(", ")
                ))
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cleaners.iter().any(|c| c.name() == name)
    }

    pub fn list_cleaners(&self) -> Vec<&str> {
        self.cleaners.iter().map(|c| c.name()).collect()
    }
}

impl Default for CleanerRegistry {
    fn default() -> Self {
        Self::with_default_cleaners()
    }
}

pub(crate) fn row_id(snapshot: &QueryResult, row: usize) -> Result<String> {
    snapshot
        .value(row, ROW_ID)
        .and_then(|v| v.to_storage_text())
        .ok_or_else(|| TdmError::Validation(format!("snapshot row {} has no {}", row, ROW_ID)))
}

/// Keeps the first row of every group with identical user-column values.
pub struct DuplicateRowsCleaner;

impl TableCleaner for DuplicateRowsCleaner {
    fn name(&self) -> &'static str {
        "duplicate-rows"
    }

    fn select_removals(&self, snapshot: &QueryResult) -> Result<Vec<String>> {
        let user: Vec<usize> = snapshot
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !is_system_column(c))
            .map(|(i, _)| i)
            .collect();

        let mut seen = HashSet::new();
        let mut removals = Vec::new();
        for (i, row) in snapshot.rows.iter().enumerate() {
            let key: Vec<Option<String>> = user.iter().map(|&c| row[c].to_storage_text()).collect();
            if !seen.insert(key) {
                removals.push(row_id(snapshot, i)?);
            }
        }
        Ok(removals)
    }
}

/// Removes every leased row.
pub struct OccupiedRowsCleaner;

impl TableCleaner for OccupiedRowsCleaner {
    fn name(&self) -> &'static str {
        "occupied-rows"
    }

    fn select_removals(&self, snapshot: &QueryResult) -> Result<Vec<String>> {
        let mut removals = Vec::new();
        for i in 0..snapshot.row_count() {
            if snapshot.value(i, OCCUPIED_BY).is_some_and(|v| !v.is_null()) {
                removals.push(row_id(snapshot, i)?);
            }
        }
        Ok(removals)
    }
}
