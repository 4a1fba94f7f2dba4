use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use x509_parser::der_parser::oid;
use x509_parser::extensions::ParsedExtension;
use x509_parser::oid_registry::Oid;
use x509_parser::prelude::*;

use crate::error::ParseError;
use crate::models::{CertificateRecord, FqdnSet, LedgerEntry};

const OID_X509_EXT_CT_POISON: Oid<'static> = oid!(1.3.6 .1 .4 .1 .11129 .2 .4 .3);
const OID_COMMON_NAME: &str = "2.5.4.3";

/// RFC 5280 4.1.2.5: `99991231235959Z` means the certificate has no
/// well-defined expiration date.
const NO_EXPIRY_TIMESTAMP: i64 = 253_402_300_799;

/// Decode a base64 ledger payload into DER bytes.
pub fn decode_payload(b64: &str) -> Result<Vec<u8>, ParseError> {
    STANDARD.decode(b64.trim()).map_err(|_| ParseError::Encoding)
}

pub fn parse_entry(entry: &LedgerEntry) -> Result<CertificateRecord, ParseError> {
    parse_certificate(entry.certificate_id, entry.issuer_ca_id, &entry.der)
}

/// Extract the fields the estimator needs from a DER certificate or
/// precertificate.
///
/// # Arguments
/// * `certificate_id` - Ledger id, copied into the record unchanged.
/// * `issuer_ca_id` - Ledger issuer id, copied into the record unchanged.
/// * `der` - Raw DER bytes of the (pre)certificate.
///
/// # Returns
/// The record, or a `ParseError` when the bytes are not a certificate, carry
/// no DNS names, or have a validity outside the representable range.
pub fn parse_certificate(
    certificate_id: i64,
    issuer_ca_id: i64,
    der: &[u8],
) -> Result<CertificateRecord, ParseError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| ParseError::Der(e.to_string()))?;

    let common_name = extract_common_name(cert.subject());
    let mut names: Vec<String> = Vec::new();

    if let Some(ref cn) = common_name {
        if !cn.is_empty() && !cert.is_ca() {
            names.push(cn.clone());
        }
    }

    let mut is_precertificate = false;
    for extension in cert.extensions() {
        if extension.oid == OID_X509_EXT_CT_POISON {
            is_precertificate = true;
            continue;
        }
        if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    names.push(dns.to_string());
                }
            }
        }
    }

    let fqdn_set = FqdnSet::new(&names);
    if fqdn_set.is_empty() {
        return Err(ParseError::NoNames);
    }

    let not_before = DateTime::<Utc>::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or(ParseError::Validity)?;
    let not_after_ts = cert.validity().not_after.timestamp();
    let not_after = if not_after_ts >= NO_EXPIRY_TIMESTAMP {
        None
    } else {
        Some(DateTime::<Utc>::from_timestamp(not_after_ts, 0).ok_or(ParseError::Validity)?)
    };

    Ok(CertificateRecord {
        certificate_id,
        issuer_ca_id,
        common_name,
        fqdn_set,
        not_before,
        not_after,
        is_precertificate,
    })
}

fn extract_common_name(name: &X509Name) -> Option<String> {
    for rdn in name.iter() {
        for attr in rdn.iter() {
            if attr.attr_type().to_id_string() != OID_COMMON_NAME {
                continue;
            }
            let value = attr.attr_value();
            let value_str = value
                .as_str()
                .ok()
                .or_else(|| std::str::from_utf8(value.data).ok());
            if let Some(v) = value_str {
                return Some(v.to_string());
            }
        }
    }
    None
}
