//! Portfolio performance calculator.
//!
//! Pure numerical core: no IO. Fetching history is delegated to a
//! [`PortfolioDataSource`] by [`PerformanceService`].

pub mod calculator;
pub mod cash_flow;
pub mod metrics;
pub mod service;
pub mod xirr;

pub use calculator::{PerformanceCalculator, PerformanceMetrics};
pub use cash_flow::{CashFlow, CashFlowSeries, FlowKind, Transaction, TransactionKind, ValueSnapshot};
pub use metrics::{
    DEFAULT_RISK_FREE_RATE, SnapshotCadence, annualized_return, cash_on_cash_return, moic, sharpe_ratio,
    total_invested, total_return, volatility,
};
pub use service::{DataSourceError, PerformanceService, PerformanceSnapshot, PortfolioDataSource, PortfolioHistory};
pub use xirr::{XirrOutcome, XirrSolver, irr};
