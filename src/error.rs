use std::time::Duration;
use thiserror::Error;

/// Rejected invocation parameters. Raised before the ledger is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("domain must not be empty")]
    EmptyDomain,
    #[error("malformed domain {domain:?}: {reason}")]
    MalformedDomain { domain: String, reason: &'static str },
    #[error("malformed lookback span {0:?}")]
    MalformedLookback(String),
    #[error("lookback span must be positive")]
    NonPositiveLookback,
    #[error("malformed timestamp {0:?}, expected RFC 3339")]
    MalformedTimestamp(String),
}

/// Errors that can occur while reading candidate records from a ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger query failed: {0}")]
    Query(String),
    #[error("unexpected ledger schema: {0}")]
    Schema(String),
    #[error("ledger query timed out after {0:?}")]
    Timeout(Duration),
}

impl From<deltalake::DeltaTableError> for LedgerError {
    fn from(err: deltalake::DeltaTableError) -> Self {
        match err {
            deltalake::DeltaTableError::NotATable(_)
            | deltalake::DeltaTableError::InvalidTableLocation(_) => {
                LedgerError::Unavailable(err.to_string())
            }
            other => LedgerError::Query(other.to_string()),
        }
    }
}

impl From<deltalake::datafusion::error::DataFusionError> for LedgerError {
    fn from(err: deltalake::datafusion::error::DataFusionError) -> Self {
        LedgerError::Query(err.to_string())
    }
}

/// Failure of a single `estimate` call.
#[derive(Debug, Error)]
pub enum EstimateError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    DataSource(#[from] LedgerError),
}

/// Why a single ledger payload could not be turned into a record.
/// Never propagated out of an estimate; the record is skipped instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload is not valid base64")]
    Encoding,
    #[error("payload is not a DER X.509 certificate: {0}")]
    Der(String),
    #[error("certificate carries no usable subject names")]
    NoNames,
    #[error("certificate validity out of range")]
    Validity,
}

/// Failure of a bulk import into the Delta ledger.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
