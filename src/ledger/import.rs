use serde::Deserialize;
use tracing::{info, warn};

use super::delta::{append_rows, LedgerRow};
use crate::error::ImportError;
use crate::parser;

/// One line of an observation file.
#[derive(Debug, Deserialize)]
struct ObservationLine {
    certificate_id: i64,
    issuer_ca_id: i64,
    /// Base64 DER.
    der: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Parse JSON-lines observations into ledger rows. Blank lines are ignored;
/// malformed lines and unparseable certificates are skipped with a warning.
pub fn parse_observations(content: &str) -> (Vec<LedgerRow>, usize) {
    let mut rows = Vec::new();
    let mut skipped = 0usize;

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let obs: ObservationLine = match serde_json::from_str(line) {
            Ok(obs) => obs,
            Err(e) => {
                warn!(line = lineno + 1, error = %e, "Skipping malformed observation");
                skipped += 1;
                continue;
            }
        };

        let row = parser::decode_payload(&obs.der).and_then(|der| {
            LedgerRow::from_der(obs.certificate_id, obs.issuer_ca_id, &der)
        });
        match row {
            Ok(row) => rows.push(row),
            Err(e) => {
                warn!(
                    line = lineno + 1,
                    certificate_id = obs.certificate_id,
                    error = %e,
                    "Skipping unparseable certificate"
                );
                skipped += 1;
            }
        }
    }

    (rows, skipped)
}

/// Append every usable observation in `path` to the ledger at `table_path`
/// in a single write.
pub async fn import_file(path: &str, table_path: &str) -> Result<ImportSummary, ImportError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ImportError::Read {
            path: path.to_string(),
            source,
        })?;

    let (rows, skipped) = parse_observations(&content);
    let imported = append_rows(table_path, &rows).await?;

    info!(path, table_path, imported, skipped, "Import complete");
    Ok(ImportSummary { imported, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainMatcher;
    use crate::ledger::{CandidateQuery, DeltaLedger, Ledger};
    use crate::test_support::{now, precert_der, CertSpec};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use chrono::Duration;
    use std::fs;

    fn line(id: i64, issuer: i64, der: &[u8]) -> String {
        serde_json::json!({
            "certificate_id": id,
            "issuer_ca_id": issuer,
            "der": STANDARD.encode(der),
        })
        .to_string()
    }

    #[test]
    fn test_parse_observations_skips_bad_lines() {
        let good = precert_der(&CertSpec::new("example.com", &["www.example.com"]));
        let content = [
            line(7, 3, &good),
            String::new(),
            "{not json".to_string(),
            r#"{"certificate_id":8,"issuer_ca_id":3,"der":"!!!"}"#.to_string(),
            line(9, 3, &[0x30, 0x00]),
        ]
        .join("\n");

        let (rows, skipped) = parse_observations(&content);
        assert_eq!(rows.len(), 1);
        assert_eq!(skipped, 3);
        assert_eq!(rows[0].certificate_id, 7);
        assert_eq!(rows[0].issuer_ca_id, 3);
        assert_eq!(rows[0].all_domains, vec!["example.com", "www.example.com"]);
    }

    #[tokio::test]
    async fn test_import_file_round_trips_through_ledger() {
        let dir = "/tmp/certquota_test_import";
        let _ = fs::remove_dir_all(dir);
        fs::create_dir_all(dir).unwrap();
        let input = format!("{}/obs.jsonl", dir);
        let table = format!("{}/ledger", dir);

        let der = precert_der(&CertSpec::new("api.example.com", &[]));
        fs::write(&input, format!("{}\nnot json\n", line(42, 1, &der))).unwrap();

        let summary = import_file(&input, &table).await.unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                imported: 1,
                skipped: 1
            }
        );

        let ledger = DeltaLedger::new(table.clone(), std::time::Duration::from_secs(30));
        let query = CandidateQuery {
            matcher: DomainMatcher::new("example.com").unwrap(),
            not_after_from: now() - Duration::days(180),
            not_after_to: now() + Duration::days(180),
        };
        let got = ledger.fetch_candidates(&query).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].certificate_id, 42);
        assert_eq!(got[0].der, der);

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_missing_input_file() {
        let err = import_file("/tmp/certquota_test_no_such_file.jsonl", "/tmp/unused")
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Read { .. }));
    }
}
