//! Cost tracker.
//!
//! Converts token usage to USD through the catalog and keeps an append-only,
//! in-memory list of immutable cost records for the admin surface. All
//! monetary arithmetic is fixed-scale decimal (6 dp); the public surface
//! exposes values as `f64` rounded from that scale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::ModelCatalog;

/// Decimal places used for all stored USD amounts.
const USD_SCALE: u32 = 6;

/// Immutable record of one completed request.
#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    /// Per-process tie-breaker for records sharing a timestamp.
    pub sequence: u64,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: Decimal,
    pub request_id: String,
    /// True when the model was unknown to the catalog and priced at zero.
    pub unpriced: bool,
}

/// Aggregated view over a set of cost records.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_requests: usize,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub by_provider: HashMap<String, f64>,
    pub by_model: HashMap<String, f64>,
}

/// Filter for [`CostTracker::summary`]. Empty filter covers everything.
#[derive(Debug, Clone, Default)]
pub struct SummaryFilter {
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Calendar month as `(year, month)`.
    pub month: Option<(i32, u32)>,
}

/// Records per-request cost and answers aggregate queries.
pub struct CostTracker {
    catalog: Arc<ModelCatalog>,
    records: RwLock<Vec<CostRecord>>,
    sequence: AtomicU64,
}

impl CostTracker {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self {
            catalog,
            records: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Compute the cost of a request without recording it.
    ///
    /// Returns `(cost, unpriced)`; unknown models cost zero and are flagged.
    pub fn compute_cost(
        &self,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> (Decimal, bool) {
        match self.catalog.price_for(model) {
            Some((input_per_1k, output_per_1k)) => {
                let thousand = Decimal::from(1000);
                let cost = Decimal::from(prompt_tokens) / thousand * input_per_1k
                    + Decimal::from(completion_tokens) / thousand * output_per_1k;
                (cost.round_dp(USD_SCALE), false)
            }
            None => {
                warn!(model = %model, "No pricing for model, recording zero cost");
                (Decimal::ZERO, true)
            }
        }
    }

    /// Append one immutable cost record and return its USD cost.
    pub fn record(
        &self,
        provider: &str,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        request_id: &str,
    ) -> Decimal {
        let (cost, unpriced) = self.compute_cost(model, prompt_tokens, completion_tokens);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        let record = CostRecord {
            timestamp: Utc::now(),
            sequence,
            provider: provider.to_string(),
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            cost_usd: cost,
            request_id: request_id.to_string(),
            unpriced,
        };

        debug!(
            provider = %provider,
            model = %model,
            prompt_tokens,
            completion_tokens,
            cost_usd = %cost,
            request_id = %request_id,
            "cost.recorded"
        );

        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        cost
    }

    /// Total spend for one calendar month.
    pub fn month_total(&self, year: i32, month: u32) -> Decimal {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.timestamp.year() == year && r.timestamp.month() == month)
            .map(|r| r.cost_usd)
            .sum()
    }

    /// Aggregate totals for the records matching `filter`.
    pub fn summary(&self, filter: &SummaryFilter) -> CostSummary {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut summary = CostSummary::default();
        let mut total = Decimal::ZERO;
        let mut by_provider: HashMap<String, Decimal> = HashMap::new();
        let mut by_model: HashMap<String, Decimal> = HashMap::new();

        for record in records.iter().filter(|r| filter_matches(filter, r)) {
            total += record.cost_usd;
            summary.total_requests += 1;
            summary.total_prompt_tokens += u64::from(record.prompt_tokens);
            summary.total_completion_tokens += u64::from(record.completion_tokens);
            *by_provider.entry(record.provider.clone()).or_default() += record.cost_usd;
            *by_model.entry(record.model.clone()).or_default() += record.cost_usd;
        }

        summary.total_cost_usd = to_f64(total);
        summary.by_provider = by_provider.into_iter().map(|(k, v)| (k, to_f64(v))).collect();
        summary.by_model = by_model.into_iter().map(|(k, v)| (k, to_f64(v))).collect();
        summary
    }

    /// Paginated snapshot of the record list, in arrival order.
    pub fn records(&self, offset: usize, limit: usize) -> Vec<CostRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.iter().skip(offset).take(limit).cloned().collect()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn filter_matches(filter: &SummaryFilter, record: &CostRecord) -> bool {
    if let Some(provider) = &filter.provider {
        if &record.provider != provider {
            return false;
        }
    }
    if let Some(model) = &filter.model {
        if &record.model != model {
            return false;
        }
    }
    if let Some((year, month)) = filter.month {
        if record.timestamp.year() != year || record.timestamp.month() != month {
            return false;
        }
    }
    true
}

/// Documented rounding point: decimal → f64 at the public surface.
fn to_f64(value: Decimal) -> f64 {
    value.round_dp(USD_SCALE).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tracker() -> CostTracker {
        CostTracker::new(Arc::new(ModelCatalog::new()))
    }

    #[test]
    fn test_compute_cost_azure_sota() {
        let tracker = tracker();
        // gpt-4o: $0.0025/1K in, $0.01/1K out.
        let (cost, unpriced) = tracker.compute_cost("gpt-4o", 1000, 500);
        assert_eq!(cost, dec!(0.0075));
        assert!(!unpriced);
    }

    #[test]
    fn test_compute_cost_unknown_model_is_zero() {
        let tracker = tracker();
        let (cost, unpriced) = tracker.compute_cost("mystery-model", 1000, 500);
        assert_eq!(cost, Decimal::ZERO);
        assert!(unpriced);
    }

    #[test]
    fn test_record_appends_immutable_entry() {
        let tracker = tracker();
        let cost = tracker.record("azure", "gpt-4o", 1000, 500, "req-1");
        assert_eq!(cost, dec!(0.0075));

        let records = tracker.records(0, 10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider, "azure");
        assert_eq!(records[0].request_id, "req-1");
        assert!(!records[0].unpriced);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let tracker = tracker();
        tracker.record("azure", "gpt-4o", 10, 10, "a");
        tracker.record("azure", "gpt-4o", 10, 10, "b");
        tracker.record("azure", "gpt-4o", 10, 10, "c");

        let records = tracker.records(0, 10);
        assert_eq!(
            records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_month_total_sums_current_month() {
        let tracker = tracker();
        tracker.record("azure", "gpt-4o", 1000, 500, "a");
        tracker.record("aws", "anthropic.claude-3-haiku-20240307-v1:0", 1000, 0, "b");

        let now = Utc::now();
        let total = tracker.month_total(now.year(), now.month());
        assert_eq!(total, dec!(0.0075) + dec!(0.00025));

        // A month with no records sums to zero.
        assert_eq!(tracker.month_total(1999, 1), Decimal::ZERO);
    }

    #[test]
    fn test_summary_by_provider_and_model() {
        let tracker = tracker();
        tracker.record("azure", "gpt-4o", 1000, 500, "a");
        tracker.record("azure", "gpt-4o-mini", 1000, 0, "b");
        tracker.record("gcp", "gemini-1.5-flash", 2000, 0, "c");

        let summary = tracker.summary(&SummaryFilter::default());
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_prompt_tokens, 4000);
        assert_eq!(summary.by_provider.len(), 2);
        assert!(summary.by_provider["azure"] > summary.by_provider["gcp"]);

        let azure_only = tracker.summary(&SummaryFilter {
            provider: Some("azure".into()),
            ..Default::default()
        });
        assert_eq!(azure_only.total_requests, 2);

        let model_only = tracker.summary(&SummaryFilter {
            model: Some("gemini-1.5-flash".into()),
            ..Default::default()
        });
        assert_eq!(model_only.total_requests, 1);
    }

    #[test]
    fn test_records_pagination() {
        let tracker = tracker();
        for i in 0..5 {
            tracker.record("azure", "gpt-4o", 10, 10, &format!("req-{i}"));
        }

        let page = tracker.records(2, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].request_id, "req-2");
        assert_eq!(page[1].request_id, "req-3");

        assert!(tracker.records(10, 2).is_empty());
    }

    #[test]
    fn test_zero_tokens_cost_zero() {
        let tracker = tracker();
        let (cost, _) = tracker.compute_cost("gpt-4o", 0, 0);
        assert_eq!(cost, Decimal::ZERO);
    }
}
