//! Certificate fixtures shared by unit tests.

use chrono::{DateTime, Utc};

use crate::models::LedgerEntry;

/// 2026-10-15T10:30:00Z
pub const NOW_TS: i64 = 1_792_060_200;
/// Lower bound of a 7-day window at `NOW_TS`: 2026-10-08T10:00:00Z
pub const WINDOW_START_TS: i64 = 1_791_453_600;
/// Upper bound of any window at `NOW_TS`: 2026-10-15T11:00:00Z
pub const WINDOW_END_TS: i64 = 1_792_062_000;

const DAY: i64 = 86_400;

pub fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(NOW_TS, 0).unwrap()
}

#[derive(Debug, Clone)]
pub struct CertSpec {
    cn: String,
    sans: Vec<String>,
    not_before: i64,
    not_after: i64,
}

impl CertSpec {
    /// Defaults to a 90-day certificate issued one day before `NOW_TS`.
    pub fn new(cn: &str, sans: &[&str]) -> Self {
        Self {
            cn: cn.to_string(),
            sans: sans.iter().map(|s| s.to_string()).collect(),
            not_before: NOW_TS - DAY,
            not_after: NOW_TS + 89 * DAY,
        }
    }

    pub fn not_before(mut self, ts: i64) -> Self {
        self.not_before = ts;
        self
    }

    pub fn not_after(mut self, ts: i64) -> Self {
        self.not_after = ts;
        self
    }
}

fn build(spec: &CertSpec, precert: bool, ca: bool) -> Vec<u8> {
    let mut params = rcgen::CertificateParams::new(spec.sans.clone()).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, spec.cn.as_str());
    params.is_ca = if ca {
        rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained)
    } else {
        rcgen::IsCa::NoCa
    };
    params.not_before = time::OffsetDateTime::from_unix_timestamp(spec.not_before).unwrap();
    params.not_after = time::OffsetDateTime::from_unix_timestamp(spec.not_after).unwrap();
    if precert {
        let mut poison = rcgen::CustomExtension::from_oid_content(
            &[1, 3, 6, 1, 4, 1, 11129, 2, 4, 3],
            vec![0x05, 0x00],
        );
        poison.set_criticality(true);
        params.custom_extensions.push(poison);
    }
    let key = rcgen::KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().der().to_vec()
}

/// Final (non-pre) certificate.
pub fn cert_der(spec: &CertSpec) -> Vec<u8> {
    build(spec, false, false)
}

/// Precertificate carrying the critical CT poison extension.
pub fn precert_der(spec: &CertSpec) -> Vec<u8> {
    build(spec, true, false)
}

pub fn ca_cert_der(cn: &str) -> Vec<u8> {
    build(&CertSpec::new(cn, &[]), false, true)
}

pub fn entry(certificate_id: i64, issuer_ca_id: i64, der: Vec<u8>) -> LedgerEntry {
    LedgerEntry {
        certificate_id,
        issuer_ca_id,
        der,
    }
}
