//! Dated cash flows and their construction from transaction history.
//!
//! Sign convention: negative = capital leaving the investor (investment, fee),
//! positive = value coming back (distribution, exit, current valuation).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

const SECONDS_PER_DAY: f64 = 86_400.0;
pub const DAYS_PER_YEAR: f64 = 365.25;

/// Fractional days from `from` to `to` (negative if `to` is earlier).
pub fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / SECONDS_PER_DAY
}

/// Fractional years from `from` to `to`, using 365.25-day years.
pub fn years_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    days_between(from, to) / DAYS_PER_YEAR
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowKind {
    /// Capital invested (or fees paid).
    Contribution,
    /// Realized proceeds.
    Distribution,
    /// Unrealized mark-to-market value, treated as a terminal inflow.
    Valuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CashFlow {
    pub date: DateTime<Utc>,
    pub amount: f64,
    pub kind: FlowKind,
}

impl CashFlow {
    /// Realized flow; the kind follows the sign.
    pub fn new(date: DateTime<Utc>, amount: f64) -> Self {
        let kind = if amount < 0.0 {
            FlowKind::Contribution
        } else {
            FlowKind::Distribution
        };
        Self { date, amount, kind }
    }

    pub fn valuation(date: DateTime<Utc>, value: f64) -> Self {
        Self {
            date,
            amount: value,
            kind: FlowKind::Valuation,
        }
    }

    pub fn is_realized(&self) -> bool {
        self.kind != FlowKind::Valuation
    }
}

/// Cash flows sorted ascending by date.
///
/// Sorting is stable, so same-day flows keep their input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CashFlowSeries {
    flows: Vec<CashFlow>,
}

impl CashFlowSeries {
    pub fn from_unsorted(mut flows: Vec<CashFlow>) -> Self {
        flows.retain(|f| f.amount.is_finite());
        flows.sort_by_key(|f| f.date);
        Self { flows }
    }

    /// Build the series for one portfolio.
    ///
    /// Every transaction becomes a flow signed by its kind; `current_value`,
    /// when present, is appended as a terminal valuation flow.
    pub fn from_history(transactions: &[Transaction], current_value: Option<ValueSnapshot>) -> Self {
        let mut flows: Vec<CashFlow> = transactions
            .iter()
            .filter_map(|tx| {
                if !tx.amount.is_finite() {
                    warn!(date = %tx.date, kind = ?tx.kind, "skipping transaction with non-finite amount");
                    return None;
                }
                Some(tx.to_cash_flow())
            })
            .collect();

        if let Some(snapshot) = current_value {
            if snapshot.value.is_finite() {
                flows.push(CashFlow::valuation(snapshot.date, snapshot.value));
            }
        }

        Self::from_unsorted(flows)
    }

    pub fn as_slice(&self) -> &[CashFlow] {
        &self.flows
    }

    pub fn iter(&self) -> impl Iterator<Item = &CashFlow> {
        self.flows.iter()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn first_date(&self) -> Option<DateTime<Utc>> {
        self.flows.first().map(|f| f.date)
    }

    pub fn last_date(&self) -> Option<DateTime<Utc>> {
        self.flows.last().map(|f| f.date)
    }

    /// The same series without valuation flows.
    pub fn realized(&self) -> Self {
        Self {
            flows: self.flows.iter().copied().filter(CashFlow::is_realized).collect(),
        }
    }
}

impl AsRef<[CashFlow]> for CashFlowSeries {
    fn as_ref(&self) -> &[CashFlow] {
        &self.flows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Investment,
    Fee,
    Distribution,
    Exit,
}

/// One entry of an investor's transaction history. `amount` is a magnitude;
/// the sign is derived from `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub date: DateTime<Utc>,
    pub kind: TransactionKind,
    pub amount: f64,
}

impl Transaction {
    pub fn new(date: DateTime<Utc>, kind: TransactionKind, amount: f64) -> Self {
        Self { date, kind, amount }
    }

    pub fn to_cash_flow(&self) -> CashFlow {
        let magnitude = self.amount.abs();
        match self.kind {
            TransactionKind::Investment | TransactionKind::Fee => CashFlow {
                date: self.date,
                amount: -magnitude,
                kind: FlowKind::Contribution,
            },
            TransactionKind::Distribution | TransactionKind::Exit => CashFlow {
                date: self.date,
                amount: magnitude,
                kind: FlowKind::Distribution,
            },
        }
    }
}

/// Portfolio value at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueSnapshot {
    pub date: DateTime<Utc>,
    pub value: f64,
}

impl ValueSnapshot {
    pub fn new(date: DateTime<Utc>, value: f64) -> Self {
        Self { date, value }
    }
}
