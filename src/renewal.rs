use std::collections::HashMap;

use crate::models::{CertificateRecord, FqdnSet};

/// A candidate together with its renewal flag.
#[derive(Debug, Clone, Copy)]
pub struct Classified<'a> {
    pub record: &'a CertificateRecord,
    pub is_renewal: bool,
}

/// Flag every record that has an earlier record with the same issuer and
/// identical FQDN set.
///
/// Records are grouped by `(issuer_ca_id, fqdn_set)`. The lowest
/// `certificate_id` in a group is the fresh issuance and every other member
/// is a renewal. Id order stands in for issuance order; it is not guaranteed
/// to be chronological.
pub fn classify(records: &[CertificateRecord]) -> Vec<Classified<'_>> {
    let mut first_seen: HashMap<(i64, &FqdnSet), i64> = HashMap::with_capacity(records.len());
    for record in records {
        first_seen
            .entry((record.issuer_ca_id, &record.fqdn_set))
            .and_modify(|min| *min = (*min).min(record.certificate_id))
            .or_insert(record.certificate_id);
    }

    records
        .iter()
        .map(|record| {
            let min_id = first_seen[&(record.issuer_ca_id, &record.fqdn_set)];
            Classified {
                record,
                is_renewal: record.certificate_id > min_id,
            }
        })
        .collect()
}
