use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Serializer};

/// Sorted, lower-cased, deduplicated set of every subject name on a certificate.
///
/// Equality of two sets is the only test used to decide that two
/// certificates cover the same logical subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct FqdnSet(Vec<String>);

impl FqdnSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = names
            .into_iter()
            .map(|n| n.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        names.dedup();
        Self(names)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One raw observation as returned by a ledger. The payload is the
/// certificate DER; everything else is extracted from it by the parser.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub certificate_id: i64,
    pub issuer_ca_id: i64,
    pub der: Vec<u8>,
}

/// A logged certificate after extraction from its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    /// Ledger-assigned, increasing id. Only used to order renewal chains.
    pub certificate_id: i64,
    pub issuer_ca_id: i64,
    pub common_name: Option<String>,
    pub fqdn_set: FqdnSet,
    pub not_before: DateTime<Utc>,
    /// `None` means no expiry and compares as infinitely far in the future.
    pub not_after: Option<DateTime<Utc>>,
    pub is_precertificate: bool,
}

impl CertificateRecord {
    pub fn not_after_or_infinite(&self) -> DateTime<Utc> {
        self.not_after.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Point-in-time usage summary for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaReport {
    pub domain: String,
    pub lookback_secs: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_certs: u64,
    pub new_issued: u64,
    pub renewals: u64,
    pub oldest_not_before: Option<DateTime<Utc>>,
    pub newest_not_before: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_opt_secs")]
    pub age_of_newest_before_window_end: Option<Duration>,
}

fn serialize_opt_secs<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_some(&d.num_seconds()),
        None => s.serialize_none(),
    }
}
