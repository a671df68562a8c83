//! Portfolio performance snapshots backed by a data-source collaborator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use angelhub_core::{Clock, PortfolioId, SystemClock};

use crate::calculator::{PerformanceCalculator, PerformanceMetrics};
use crate::cash_flow::{CashFlowSeries, Transaction, ValueSnapshot};

#[derive(Debug, Clone, thiserror::Error)]
pub enum DataSourceError {
    #[error("portfolio not found: {0}")]
    NotFound(PortfolioId),
    #[error("portfolio data unavailable: {0}")]
    Unavailable(String),
}

/// Raw history for one portfolio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioHistory {
    pub transactions: Vec<Transaction>,
    /// Current mark-to-market value. Falls back to the latest snapshot.
    pub current_value: Option<ValueSnapshot>,
    /// Periodic value snapshots for volatility.
    pub snapshots: Vec<ValueSnapshot>,
}

impl PortfolioHistory {
    fn valuation(&self) -> Option<ValueSnapshot> {
        self.current_value
            .or_else(|| self.snapshots.iter().copied().max_by_key(|s| s.date))
    }
}

/// Supplies transaction history and value snapshots.
pub trait PortfolioDataSource: Send + Sync {
    fn load_history(&self, portfolio_id: PortfolioId) -> Result<PortfolioHistory, DataSourceError>;
}

/// One immutable calculation result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub portfolio_id: PortfolioId,
    pub calculated_at: DateTime<Utc>,
    pub metrics: PerformanceMetrics,
}

pub struct PerformanceService {
    source: Arc<dyn PortfolioDataSource>,
    calculator: PerformanceCalculator,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PerformanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceService")
            .field("calculator", &self.calculator)
            .finish_non_exhaustive()
    }
}

impl PerformanceService {
    pub fn new(source: Arc<dyn PortfolioDataSource>) -> Self {
        Self {
            source,
            calculator: PerformanceCalculator::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_calculator(mut self, calculator: PerformanceCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn calculate(&self, portfolio_id: PortfolioId) -> Result<PerformanceSnapshot, DataSourceError> {
        self.calculate_with_rate(portfolio_id, None)
    }

    pub fn calculate_with_rate(
        &self,
        portfolio_id: PortfolioId,
        risk_free_rate: Option<f64>,
    ) -> Result<PerformanceSnapshot, DataSourceError> {
        let history = self.source.load_history(portfolio_id)?;
        debug!(
            %portfolio_id,
            transactions = history.transactions.len(),
            snapshots = history.snapshots.len(),
            "loaded portfolio history"
        );

        let series = CashFlowSeries::from_history(&history.transactions, history.valuation());
        let metrics = self
            .calculator
            .calculate_portfolio_performance(&series, &history.snapshots, risk_free_rate);

        let snapshot = PerformanceSnapshot {
            portfolio_id,
            calculated_at: self.clock.now(),
            metrics,
        };
        info!(
            %portfolio_id,
            irr = metrics.irr,
            moic = metrics.moic,
            "portfolio performance calculated"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cash_flow::TransactionKind;
    use angelhub_core::ManualClock;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    struct FixedSource(HashMap<PortfolioId, PortfolioHistory>);

    impl PortfolioDataSource for FixedSource {
        fn load_history(&self, portfolio_id: PortfolioId) -> Result<PortfolioHistory, DataSourceError> {
            self.0
                .get(&portfolio_id)
                .cloned()
                .ok_or(DataSourceError::NotFound(portfolio_id))
        }
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    #[test]
    fn snapshot_is_stamped_with_clock_time() {
        let id = PortfolioId::new();
        let history = PortfolioHistory {
            transactions: vec![Transaction::new(day(0), TransactionKind::Investment, 1_000.0)],
            current_value: Some(ValueSnapshot::new(day(365), 1_100.0)),
            snapshots: vec![],
        };
        let clock = Arc::new(ManualClock::new(day(400)));
        let service = PerformanceService::new(Arc::new(FixedSource(HashMap::from([(id, history)]))))
            .with_clock(clock);

        let snap = service.calculate(id).unwrap();
        assert_eq!(snap.portfolio_id, id);
        assert_eq!(snap.calculated_at, day(400));
        assert!((snap.metrics.irr - 0.10).abs() < 1e-3);
        assert_eq!(snap.metrics.cash_on_cash_return, 0.0);
    }

    #[test]
    fn latest_snapshot_stands_in_for_missing_current_value() {
        let history = PortfolioHistory {
            transactions: vec![Transaction::new(day(0), TransactionKind::Investment, 1_000.0)],
            current_value: None,
            snapshots: vec![ValueSnapshot::new(day(60), 900.0), ValueSnapshot::new(day(30), 950.0)],
        };
        assert_eq!(history.valuation(), Some(ValueSnapshot::new(day(60), 900.0)));
    }

    #[test]
    fn unknown_portfolio_is_an_error() {
        let service = PerformanceService::new(Arc::new(FixedSource(HashMap::new())));
        let id = PortfolioId::new();
        assert!(matches!(service.calculate(id), Err(DataSourceError::NotFound(missing)) if missing == id));
    }
}
