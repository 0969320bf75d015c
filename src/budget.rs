//! Budget circuit breaker.
//!
//! Guards the monthly spend ceiling with a three-state circuit:
//!
//!   Closed    — usage below the alert threshold, all requests admitted
//!   HalfOpen  — usage at or above the alert threshold, admitted with an
//!               alert observation (deduplicated per minute)
//!   Open      — usage at or above the breaker threshold, denied
//!
//! The circuit leaves Open only on month rollover or an explicit admin
//! reset. Admission and recording share one mutex; the rollover check runs
//! inside the same critical section as every read, so a January request can
//! never observe December's spend.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{Datelike, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::GatewayError;

/// Minimum spacing between HalfOpen alert observations.
const ALERT_INTERVAL: Duration = Duration::from_secs(60);

/// Circuit state over month-to-date spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Point-in-time snapshot of the budget for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub monthly_limit_usd: f64,
    pub current_spend_usd: f64,
    pub remaining_usd: f64,
    pub usage_ratio: f64,
    pub state: CircuitState,
    pub alert_threshold: f64,
    pub breaker_threshold: f64,
    /// Calendar month the spend covers, as `(year, month)`.
    pub month: (i32, u32),
    pub request_count: u64,
}

struct BudgetState {
    spend: Decimal,
    month: (i32, u32),
    circuit: CircuitState,
    last_alert: Option<Instant>,
    request_count: u64,
}

/// Process-wide monthly budget breaker.
pub struct BudgetBreaker {
    limit: Decimal,
    alert_threshold: Decimal,
    breaker_threshold: Decimal,
    state: Mutex<BudgetState>,
}

impl BudgetBreaker {
    /// Thresholds are ratios of the monthly limit; the caller (config
    /// validation) guarantees `limit > 0` and `0 < alert ≤ breaker ≤ 1`.
    pub fn new(monthly_limit_usd: f64, alert_threshold: f64, breaker_threshold: f64) -> Self {
        Self {
            limit: Decimal::from_f64(monthly_limit_usd).unwrap_or(Decimal::ONE),
            alert_threshold: Decimal::from_f64(alert_threshold).unwrap_or(Decimal::ONE),
            breaker_threshold: Decimal::from_f64(breaker_threshold).unwrap_or(Decimal::ONE),
            state: Mutex::new(BudgetState {
                spend: Decimal::ZERO,
                month: current_month(),
                circuit: CircuitState::Closed,
                last_alert: None,
                request_count: 0,
            }),
        }
    }

    /// Admission gate. Denies with `BudgetExceeded` when the circuit is
    /// Open; otherwise returns the state the request was admitted under.
    ///
    /// `estimated_cost_usd` is logged only — admission is based on current
    /// spend, never on projection.
    pub fn check_and_admit(&self, estimated_cost_usd: f64) -> Result<CircuitState, GatewayError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.roll_over_if_needed(&mut state);
        self.derive_circuit(&mut state);

        match state.circuit {
            CircuitState::Open => Err(GatewayError::BudgetExceeded {
                spend_usd: to_f64(state.spend),
                limit_usd: to_f64(self.limit),
            }),
            CircuitState::HalfOpen => {
                let due = state
                    .last_alert
                    .map_or(true, |t| t.elapsed() >= ALERT_INTERVAL);
                if due {
                    warn!(
                        spend_usd = %state.spend,
                        limit_usd = %self.limit,
                        estimated_cost_usd,
                        "budget.alert"
                    );
                    state.last_alert = Some(Instant::now());
                }
                Ok(CircuitState::HalfOpen)
            }
            CircuitState::Closed => Ok(CircuitState::Closed),
        }
    }

    /// Add a completed request's cost to the month-to-date spend. Never
    /// blocks admission; the new state takes effect on the next
    /// [`check_and_admit`].
    pub fn record_usage(&self, cost_usd: Decimal) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.roll_over_if_needed(&mut state);
        state.spend += cost_usd;
        state.request_count += 1;
        self.derive_circuit(&mut state);
    }

    /// Administrative reset: zero spend, Closed circuit, month unchanged.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        info!(previous_spend = %state.spend, "budget.reset");
        state.spend = Decimal::ZERO;
        state.circuit = CircuitState::Closed;
        state.last_alert = None;
        state.request_count = 0;
    }

    /// Snapshot for the admin surface.
    pub fn status(&self) -> BudgetStatus {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.roll_over_if_needed(&mut state);
        self.derive_circuit(&mut state);

        BudgetStatus {
            monthly_limit_usd: to_f64(self.limit),
            current_spend_usd: to_f64(state.spend),
            remaining_usd: to_f64((self.limit - state.spend).max(Decimal::ZERO)),
            usage_ratio: to_f64(self.usage_ratio(&state)),
            state: state.circuit,
            alert_threshold: to_f64(self.alert_threshold),
            breaker_threshold: to_f64(self.breaker_threshold),
            month: state.month,
            request_count: state.request_count,
        }
    }

    fn usage_ratio(&self, state: &BudgetState) -> Decimal {
        if self.limit <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        state.spend / self.limit
    }

    fn roll_over_if_needed(&self, state: &mut BudgetState) {
        let now = current_month();
        if state.month != now {
            info!(
                old_month = %format!("{:04}-{:02}", state.month.0, state.month.1),
                new_month = %format!("{:04}-{:02}", now.0, now.1),
                dropped_spend = %state.spend,
                "budget.monthly_reset"
            );
            state.spend = Decimal::ZERO;
            state.circuit = CircuitState::Closed;
            state.month = now;
            state.last_alert = None;
            state.request_count = 0;
        }
    }

    fn derive_circuit(&self, state: &mut BudgetState) {
        let ratio = self.usage_ratio(state);
        let next = if ratio >= self.breaker_threshold {
            CircuitState::Open
        } else if ratio >= self.alert_threshold {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        };

        if next == CircuitState::Open && state.circuit != CircuitState::Open {
            warn!(
                usage_ratio = %ratio,
                spend_usd = %state.spend,
                limit_usd = %self.limit,
                "budget.opened"
            );
        }
        state.circuit = next;
    }

    /// Test hook: force spend and month key to a known point.
    #[cfg(test)]
    pub(crate) fn seed(&self, spend: Decimal, month: (i32, u32)) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.spend = spend;
        state.month = month;
    }
}

fn current_month() -> (i32, u32) {
    let now = Utc::now();
    (now.year(), now.month())
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
