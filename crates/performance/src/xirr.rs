//! XIRR by Newton-Raphson.
//!
//! Non-convergence is a soft condition: the solver returns its last iterate and
//! reports `converged = false` instead of failing.

use serde::Serialize;
use tracing::debug;

use crate::cash_flow::{CashFlow, years_between};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct XirrOutcome {
    pub rate: f64,
    pub iterations: u32,
    pub converged: bool,
}

impl XirrOutcome {
    fn degenerate() -> Self {
        Self {
            rate: 0.0,
            iterations: 0,
            converged: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XirrSolver {
    pub guess: f64,
    pub max_iterations: u32,
    /// Converged once `|NPV| < tolerance`.
    pub tolerance: f64,
    /// Stop when `|dNPV/drate|` falls below this.
    pub min_derivative: f64,
    pub min_rate: f64,
    pub max_rate: f64,
}

impl Default for XirrSolver {
    fn default() -> Self {
        Self {
            guess: 0.10,
            max_iterations: 100,
            tolerance: 1e-4,
            min_derivative: 1e-10,
            min_rate: -0.99,
            max_rate: 10.0,
        }
    }
}

impl XirrSolver {
    pub fn with_guess(mut self, guess: f64) -> Self {
        self.guess = guess;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Annualized rate only.
    pub fn irr(&self, flows: &[CashFlow]) -> f64 {
        self.solve(flows).rate
    }

    /// `flows` must be sorted ascending by date.
    pub fn solve(&self, flows: &[CashFlow]) -> XirrOutcome {
        let Some(first) = flows.first() else {
            return XirrOutcome::degenerate();
        };
        if flows.len() < 2 {
            return XirrOutcome::degenerate();
        }

        let terms: Vec<(f64, f64)> = flows
            .iter()
            .map(|f| (f.amount, years_between(first.date, f.date)))
            .collect();

        let mut rate = self.guess.clamp(self.min_rate, self.max_rate);

        for iteration in 0..self.max_iterations {
            let (npv, derivative) = npv_and_derivative(&terms, rate);

            if npv.abs() < self.tolerance {
                return XirrOutcome {
                    rate,
                    iterations: iteration,
                    converged: true,
                };
            }
            if derivative.abs() < self.min_derivative || !derivative.is_finite() {
                debug!(rate, iteration, derivative, "xirr: derivative too small; stopping early");
                return XirrOutcome {
                    rate,
                    iterations: iteration,
                    converged: false,
                };
            }

            let next = rate - npv / derivative;
            if !next.is_finite() {
                debug!(rate, iteration, "xirr: step diverged; keeping last rate");
                return XirrOutcome {
                    rate,
                    iterations: iteration,
                    converged: false,
                };
            }
            rate = next.clamp(self.min_rate, self.max_rate);
        }

        debug!(rate, iterations = self.max_iterations, "xirr: did not converge");
        XirrOutcome {
            rate,
            iterations: self.max_iterations,
            converged: false,
        }
    }
}

fn npv_and_derivative(terms: &[(f64, f64)], rate: f64) -> (f64, f64) {
    let base = 1.0 + rate;
    terms.iter().fold((0.0, 0.0), |(npv, d), &(amount, t)| {
        let discount = base.powf(t);
        (npv + amount / discount, d - amount * t / (discount * base))
    })
}

/// XIRR with the default solver settings.
pub fn irr(flows: &[CashFlow]) -> f64 {
    XirrSolver::default().irr(flows)
}
