use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cash_flow::{CashFlowSeries, ValueSnapshot};
use crate::metrics::{self, DEFAULT_RISK_FREE_RATE};
use crate::xirr::XirrSolver;

/// Performance figures for one portfolio. Rates are decimals (0.15 = 15%),
/// multiples are raw (2.5 = 2.5x).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub irr: f64,
    pub moic: f64,
    pub cash_on_cash_return: f64,
    pub sharpe_ratio: f64,
    pub volatility: f64,
    pub total_return: f64,
    pub annualized_return: f64,
}

/// Stateless metrics calculator; safe to share across threads.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceCalculator {
    solver: XirrSolver,
    risk_free_rate: f64,
}

impl Default for PerformanceCalculator {
    fn default() -> Self {
        Self {
            solver: XirrSolver::default(),
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
        }
    }
}

impl PerformanceCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = rate;
        self
    }

    pub fn with_solver(mut self, solver: XirrSolver) -> Self {
        self.solver = solver;
        self
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_free_rate
    }

    /// Compute every metric for one portfolio.
    ///
    /// `risk_free_rate` overrides the calculator's default for this call.
    pub fn calculate_portfolio_performance(
        &self,
        cash_flows: &CashFlowSeries,
        snapshots: &[ValueSnapshot],
        risk_free_rate: Option<f64>,
    ) -> PerformanceMetrics {
        let flows = cash_flows.as_slice();
        let rf = risk_free_rate.unwrap_or(self.risk_free_rate);

        let xirr = self.solver.solve(flows);
        if !xirr.converged && flows.len() >= 2 {
            debug!(rate = xirr.rate, iterations = xirr.iterations, "irr reported without convergence");
        }

        let annualized_return = metrics::annualized_return(flows);
        let volatility = metrics::volatility(snapshots);

        PerformanceMetrics {
            irr: xirr.rate,
            moic: metrics::moic(flows),
            cash_on_cash_return: metrics::cash_on_cash_return(flows),
            sharpe_ratio: metrics::sharpe_ratio(annualized_return, volatility, rf),
            volatility,
            total_return: metrics::total_return(flows),
            annualized_return,
        }
    }
}
