use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::DomainMatcher;
use crate::error::{EstimateError, InputError};
use crate::ledger::{CandidateQuery, Ledger};
use crate::models::{CertificateRecord, QuotaReport};
use crate::parser;
use crate::renewal::{self, Classified};
use crate::window::QuotaWindow;

/// Default half-width of the `not_after` band used to select candidates.
///
/// Twice the 90-day validity of the issuer this was tuned for. An issuer
/// with longer-lived certificates needs a wider band.
pub const DEFAULT_CANDIDATE_MARGIN_DAYS: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimatorOptions {
    pub candidate_margin: Duration,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self {
            candidate_margin: Duration::days(DEFAULT_CANDIDATE_MARGIN_DAYS),
        }
    }
}

/// Quota estimator bound to a ledger.
pub struct Estimator<L> {
    ledger: L,
    options: EstimatorOptions,
}

impl<L: Ledger> Estimator<L> {
    pub fn new(ledger: L) -> Self {
        Self::with_options(ledger, EstimatorOptions::default())
    }

    pub fn with_options(ledger: L, options: EstimatorOptions) -> Self {
        Self { ledger, options }
    }

    pub async fn estimate(
        &self,
        domain: &str,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<QuotaReport, EstimateError> {
        estimate_with_options(domain, lookback, now, &self.ledger, &self.options).await
    }

    /// Estimate against the wall clock.
    pub async fn estimate_now(
        &self,
        domain: &str,
        lookback: Duration,
    ) -> Result<QuotaReport, EstimateError> {
        self.estimate(domain, lookback, Utc::now()).await
    }
}

/// Estimate with the default candidate margin.
pub async fn estimate<L: Ledger + ?Sized>(
    domain: &str,
    lookback: Duration,
    now: DateTime<Utc>,
    ledger: &L,
) -> Result<QuotaReport, EstimateError> {
    estimate_with_options(domain, lookback, now, ledger, &EstimatorOptions::default()).await
}

pub async fn estimate_with_options<L: Ledger + ?Sized>(
    domain: &str,
    lookback: Duration,
    now: DateTime<Utc>,
    ledger: &L,
    options: &EstimatorOptions,
) -> Result<QuotaReport, EstimateError> {
    let start = Instant::now();
    let result = run_estimate(domain, lookback, now, ledger, options).await;

    let status = match &result {
        Ok(_) => "ok",
        Err(EstimateError::Input(_)) => "invalid_input",
        Err(EstimateError::DataSource(_)) => "data_source_error",
    };
    metrics::counter!("certquota_estimates", "status" => status).increment(1);
    metrics::histogram!("certquota_estimate_duration_seconds")
        .record(start.elapsed().as_secs_f64());

    result
}

async fn run_estimate<L: Ledger + ?Sized>(
    domain: &str,
    lookback: Duration,
    now: DateTime<Utc>,
    ledger: &L,
    options: &EstimatorOptions,
) -> Result<QuotaReport, EstimateError> {
    let matcher = DomainMatcher::new(domain)?;
    if lookback <= Duration::zero() {
        return Err(InputError::NonPositiveLookback.into());
    }
    let window = QuotaWindow::compute(now, lookback)
        .ok_or_else(|| InputError::MalformedLookback(format!("{}s", lookback.num_seconds())))?;

    let query = CandidateQuery {
        matcher,
        not_after_from: now
            .checked_sub_signed(options.candidate_margin)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        not_after_to: now
            .checked_add_signed(options.candidate_margin)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    };

    let entries = ledger.fetch_candidates(&query).await?;
    let fetched = entries.len();

    let mut seen_ids = HashSet::with_capacity(fetched);
    let mut candidates: Vec<CertificateRecord> = Vec::with_capacity(fetched);
    for entry in &entries {
        if seen_ids.contains(&entry.certificate_id) {
            debug!(certificate_id = entry.certificate_id, "Duplicate ledger entry ignored");
            continue;
        }
        // An id is claimed only by a payload that parses
        let record = match parser::parse_entry(entry) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    certificate_id = entry.certificate_id,
                    error = %e,
                    "Skipping unparseable certificate"
                );
                metrics::counter!("certquota_records_skipped").increment(1);
                continue;
            }
        };
        seen_ids.insert(record.certificate_id);
        if is_candidate(&record, &query) {
            candidates.push(record);
        }
    }

    let classified = renewal::classify(&candidates);
    let report = build_report(query.matcher.domain(), lookback, window, &classified);

    info!(
        domain = %report.domain,
        window_start = %report.window_start,
        window_end = %report.window_end,
        fetched,
        candidates = candidates.len(),
        total_certs = report.total_certs,
        new_issued = report.new_issued,
        renewals = report.renewals,
        "Quota estimate complete"
    );

    Ok(report)
}

/// Precertificate, a name passing the exact suffix check, and `not_after`
/// inside the margin band.
fn is_candidate(record: &CertificateRecord, query: &CandidateQuery) -> bool {
    if !record.is_precertificate {
        return false;
    }
    if !query.matcher.matches_any(record.fqdn_set.iter()) {
        return false;
    }
    let not_after = record.not_after_or_infinite();
    query.not_after_from <= not_after && not_after <= query.not_after_to
}

/// Aggregate classified candidates over the quota window.
pub fn build_report(
    domain: &str,
    lookback: Duration,
    window: QuotaWindow,
    classified: &[Classified<'_>],
) -> QuotaReport {
    let mut total_certs = 0u64;
    let mut renewals = 0u64;
    let mut oldest: Option<DateTime<Utc>> = None;
    let mut newest: Option<DateTime<Utc>> = None;

    for c in classified
        .iter()
        .filter(|c| window.contains(c.record.not_before))
    {
        let nb = c.record.not_before;
        total_certs += 1;
        if c.is_renewal {
            renewals += 1;
        }
        oldest = Some(oldest.map_or(nb, |o| o.min(nb)));
        newest = Some(newest.map_or(nb, |n| n.max(nb)));
    }

    QuotaReport {
        domain: domain.to_string(),
        lookback_secs: lookback.num_seconds(),
        window_start: window.start,
        window_end: window.end,
        total_certs,
        new_issued: total_certs - renewals,
        renewals,
        oldest_not_before: oldest,
        newest_not_before: newest,
        age_of_newest_before_window_end: newest.map(|n| window.end - n),
    }
}
