use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CandidateQuery, Ledger};
use crate::error::LedgerError;
use crate::models::LedgerEntry;
use crate::parser;

struct IndexedEntry {
    entry: LedgerEntry,
    names: Vec<String>,
}

/// Linear-scan ledger over entries held in memory.
///
/// Each entry carries the subject names it is indexed under. The scan runs
/// the same broad substring pre-filter an indexed ledger would.
#[derive(Default)]
pub struct InMemoryLedger {
    entries: RwLock<Vec<IndexedEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry indexed under the names found in its payload. Entries
    /// whose payload cannot be parsed are indexed under no names.
    pub fn insert(&self, entry: LedgerEntry) {
        let names = parser::parse_entry(&entry)
            .map(|record| record.fqdn_set.iter().map(str::to_string).collect())
            .unwrap_or_default();
        self.insert_indexed(entry, names);
    }

    /// Add an entry indexed under explicitly supplied names.
    pub fn insert_indexed(&self, entry: LedgerEntry, names: Vec<String>) {
        self.entries.write().push(IndexedEntry { entry, names });
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl FromIterator<LedgerEntry> for InMemoryLedger {
    fn from_iter<I: IntoIterator<Item = LedgerEntry>>(iter: I) -> Self {
        let ledger = Self::new();
        for entry in iter {
            ledger.insert(entry);
        }
        ledger
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn fetch_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .filter(|e| e.names.iter().any(|n| query.matcher.prefilter(n)))
            .map(|e| e.entry.clone())
            .collect())
    }
}
