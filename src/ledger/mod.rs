//! Read access to certificate observations.
//!
//! A ledger answers one question: which entries might cover a domain and
//! expire inside a time range. It may over-approximate both conditions; the
//! estimator re-checks every returned entry after parsing it.

mod delta;
mod import;
mod memory;

pub use delta::*;
pub use import::*;
pub use memory::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::DomainMatcher;
use crate::error::LedgerError;
use crate::models::LedgerEntry;

/// Filter pushed down to the ledger.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub matcher: DomainMatcher,
    /// Inclusive bounds on `not_after`; an absent `not_after` is infinite.
    pub not_after_from: DateTime<Utc>,
    pub not_after_to: DateTime<Utc>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Entries whose indexed subject names pass the broad pre-filter for
    /// `query.matcher`. Implementations that can range-filter on `not_after`
    /// should; those that cannot may return extra entries.
    async fn fetch_candidates(&self, query: &CandidateQuery)
        -> Result<Vec<LedgerEntry>, LedgerError>;
}

#[async_trait]
impl<L: Ledger + ?Sized> Ledger for std::sync::Arc<L> {
    async fn fetch_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).fetch_candidates(query).await
    }
}
