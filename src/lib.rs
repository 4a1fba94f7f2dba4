//! Certificate-issuance quota estimation over a certificate transparency
//! ledger.
//!
//! Given a registered domain and a lookback span, [`estimator::estimate`]
//! counts the precertificates logged for the domain inside an hour-aligned
//! window and splits them into new issuances and renewals.

pub mod api;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod estimator;
pub mod ledger;
pub mod lookback;
pub mod models;
pub mod parser;
pub mod renewal;
pub mod window;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{EstimateError, InputError, LedgerError};
pub use estimator::{estimate, Estimator, EstimatorOptions};
pub use ledger::{CandidateQuery, DeltaLedger, InMemoryLedger, Ledger};
pub use models::{CertificateRecord, FqdnSet, LedgerEntry, QuotaReport};
