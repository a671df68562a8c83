//! Derived return and risk metrics.
//!
//! Every function returns `0.0` on degenerate input (empty series, zero
//! denominators, non-finite intermediates) instead of failing.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cash_flow::{CashFlow, DAYS_PER_YEAR, ValueSnapshot, days_between, years_between};

pub const DEFAULT_RISK_FREE_RATE: f64 = 0.02;

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// Sum of absolute negative flows.
pub fn total_invested(flows: &[CashFlow]) -> f64 {
    flows.iter().filter(|f| f.amount < 0.0).map(|f| -f.amount).sum()
}

fn total_positive(flows: &[CashFlow]) -> f64 {
    flows.iter().filter(|f| f.amount > 0.0).map(|f| f.amount).sum()
}

/// Multiple on invested capital: positive flows over absolute negative flows.
pub fn moic(flows: &[CashFlow]) -> f64 {
    let invested = total_invested(flows);
    if invested <= 0.0 {
        return 0.0;
    }
    finite_or_zero(total_positive(flows) / invested)
}

/// MOIC over realized flows only (valuation flows excluded).
pub fn cash_on_cash_return(flows: &[CashFlow]) -> f64 {
    let realized: Vec<CashFlow> = flows.iter().copied().filter(CashFlow::is_realized).collect();
    moic(&realized)
}

/// Net of all flows over invested capital.
pub fn total_return(flows: &[CashFlow]) -> f64 {
    let invested = total_invested(flows);
    if invested <= 0.0 {
        return 0.0;
    }
    let net: f64 = flows.iter().map(|f| f.amount).sum();
    finite_or_zero(net / invested)
}

/// `(1 + total_return)^(1/years) - 1` over the first-to-last flow span.
pub fn annualized_return(flows: &[CashFlow]) -> f64 {
    let (Some(first), Some(last)) = (flows.first(), flows.last()) else {
        return 0.0;
    };
    if flows.len() < 2 {
        return 0.0;
    }
    let years = years_between(first.date, last.date);
    if years <= 0.0 {
        return 0.0;
    }
    let growth = 1.0 + total_return(flows);
    if growth < 0.0 {
        return 0.0;
    }
    finite_or_zero(growth.powf(1.0 / years) - 1.0)
}

/// Spacing between value snapshots, inferred from their mean gap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotCadence {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annual,
    /// No recognised cadence; carries the mean gap in days.
    Irregular(f64),
}

impl SnapshotCadence {
    pub fn from_mean_spacing(days: f64) -> Self {
        match days {
            d if (0.5..=1.5).contains(&d) => Self::Daily,
            d if (5.0..=9.0).contains(&d) => Self::Weekly,
            d if (25.0..=35.0).contains(&d) => Self::Monthly,
            d if (80.0..=100.0).contains(&d) => Self::Quarterly,
            d if (350.0..=380.0).contains(&d) => Self::Annual,
            d => Self::Irregular(d),
        }
    }

    /// Infer from sorted snapshots; `None` with fewer than two.
    pub fn infer(snapshots: &[ValueSnapshot]) -> Option<Self> {
        let (first, last) = (snapshots.first()?, snapshots.last()?);
        if snapshots.len() < 2 {
            return None;
        }
        let mean = days_between(first.date, last.date) / (snapshots.len() - 1) as f64;
        Some(Self::from_mean_spacing(mean))
    }

    pub fn periods_per_year(&self) -> f64 {
        match self {
            Self::Daily => 365.0,
            Self::Weekly => 52.0,
            Self::Monthly => 12.0,
            Self::Quarterly => 4.0,
            Self::Annual => 1.0,
            Self::Irregular(days) if *days > 0.0 => DAYS_PER_YEAR / days,
            Self::Irregular(_) => 0.0,
        }
    }
}

/// Period-over-period percentage returns. Periods starting from a zero value
/// are skipped.
pub fn periodic_returns(snapshots: &[ValueSnapshot]) -> Vec<f64> {
    snapshots
        .windows(2)
        .filter(|w| w[0].value != 0.0)
        .map(|w| (w[1].value - w[0].value) / w[0].value)
        .filter(|r| r.is_finite())
        .collect()
}

fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// Annualized volatility of a snapshot series, with the cadence used.
///
/// Snapshots are sorted by date first. Monthly series scale by √12; other
/// recognised cadences by their own periods per year; irregular spacing is
/// annualized from the mean gap and logged.
pub fn volatility_with_cadence(snapshots: &[ValueSnapshot]) -> (f64, Option<SnapshotCadence>) {
    let mut sorted = snapshots.to_vec();
    sorted.sort_by_key(|s| s.date);

    let Some(cadence) = SnapshotCadence::infer(&sorted) else {
        return (0.0, None);
    };
    let returns = periodic_returns(&sorted);
    if returns.len() < 2 {
        return (0.0, Some(cadence));
    }

    if let SnapshotCadence::Irregular(days) = cadence {
        warn!(
            mean_spacing_days = days,
            snapshots = sorted.len(),
            "value snapshots have no regular cadence; annualizing from mean spacing"
        );
    }

    let vol = population_std_dev(&returns) * cadence.periods_per_year().sqrt();
    (finite_or_zero(vol), Some(cadence))
}

pub fn volatility(snapshots: &[ValueSnapshot]) -> f64 {
    volatility_with_cadence(snapshots).0
}

pub fn sharpe_ratio(annualized_return: f64, volatility: f64, risk_free_rate: f64) -> f64 {
    if volatility == 0.0 || !volatility.is_finite() {
        return 0.0;
    }
    finite_or_zero((annualized_return - risk_free_rate) / volatility)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    use crate::cash_flow::CashFlowSeries;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn monthly(values: &[f64]) -> Vec<ValueSnapshot> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| ValueSnapshot::new(day(i as i64 * 30), *v))
            .collect()
    }

    #[test]
    fn moic_of_single_exit() {
        let flows = [CashFlow::new(day(0), -1_000.0), CashFlow::new(day(700), 2_500.0)];
        assert!((moic(&flows) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn degenerate_inputs_are_zero() {
        assert_eq!(moic(&[]), 0.0);
        assert_eq!(total_return(&[]), 0.0);
        assert_eq!(annualized_return(&[]), 0.0);
        assert_eq!(volatility(&[]), 0.0);
        assert_eq!(sharpe_ratio(0.1, 0.0, DEFAULT_RISK_FREE_RATE), 0.0);
        assert_eq!(moic(&[CashFlow::new(day(0), 500.0)]), 0.0);
    }

    #[test]
    fn cash_on_cash_ignores_valuation() {
        let flows = [
            CashFlow::new(day(0), -1_000.0),
            CashFlow::new(day(200), 300.0),
            CashFlow::valuation(day(365), 1_200.0),
        ];
        assert!((cash_on_cash_return(&flows) - 0.3).abs() < 1e-12);
        assert!((moic(&flows) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn cash_on_cash_equals_moic_without_valuation() {
        let flows = [CashFlow::new(day(0), -400.0), CashFlow::new(day(90), 600.0)];
        assert_eq!(cash_on_cash_return(&flows), moic(&flows));
    }

    #[test]
    fn total_and_annualized_return() {
        let flows = [CashFlow::new(day(0), -1_000.0), CashFlow::new(day(730), 1_210.0)];
        assert!((total_return(&flows) - 0.21).abs() < 1e-12);

        let years = 730.0 / 365.25;
        let expected = 1.21f64.powf(1.0 / years) - 1.0;
        assert!((annualized_return(&flows) - expected).abs() < 1e-12);
    }

    #[test]
    fn annualized_return_needs_a_time_span() {
        let flows = [CashFlow::new(day(3), -1_000.0), CashFlow::new(day(3), 1_500.0)];
        assert_eq!(annualized_return(&flows), 0.0);
    }

    #[test]
    fn monthly_volatility_scales_by_sqrt_12() {
        let snaps = monthly(&[100.0, 110.0, 99.0, 108.9]);
        let (vol, cadence) = volatility_with_cadence(&snaps);
        assert_eq!(cadence, Some(SnapshotCadence::Monthly));

        let returns = [0.10, -0.10, 0.10];
        let mean = 0.1 / 3.0;
        let var = returns.iter().map(|r: &f64| (r - mean).powi(2)).sum::<f64>() / 3.0;
        assert!((vol - var.sqrt() * 12f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn constant_growth_has_zero_volatility() {
        let snaps = monthly(&[100.0, 110.0, 121.0, 133.1]);
        assert!(volatility(&snaps) < 1e-9);
    }

    #[test]
    fn cadence_inference() {
        assert_eq!(SnapshotCadence::from_mean_spacing(1.0), SnapshotCadence::Daily);
        assert_eq!(SnapshotCadence::from_mean_spacing(7.0), SnapshotCadence::Weekly);
        assert_eq!(SnapshotCadence::from_mean_spacing(30.4), SnapshotCadence::Monthly);
        assert_eq!(SnapshotCadence::from_mean_spacing(91.0), SnapshotCadence::Quarterly);
        assert_eq!(SnapshotCadence::from_mean_spacing(365.0), SnapshotCadence::Annual);
        assert_eq!(SnapshotCadence::from_mean_spacing(45.0), SnapshotCadence::Irregular(45.0));
        assert!((SnapshotCadence::Irregular(45.0).periods_per_year() - 365.25 / 45.0).abs() < 1e-12);
    }

    #[test]
    fn quarterly_snapshots_use_four_periods() {
        let snaps: Vec<_> = [100.0, 120.0, 90.0]
            .iter()
            .enumerate()
            .map(|(i, v)| ValueSnapshot::new(day(i as i64 * 91), *v))
            .collect();
        let (vol, cadence) = volatility_with_cadence(&snaps);
        assert_eq!(cadence, Some(SnapshotCadence::Quarterly));

        let returns = [0.2, -0.25];
        let mean = -0.025;
        let sd = (returns.iter().map(|r: &f64| (r - mean).powi(2)).sum::<f64>() / 2.0).sqrt();
        assert!((vol - sd * 2.0).abs() < 1e-9);
    }

    #[test]
    fn unsorted_snapshots_are_sorted_first() {
        let mut snaps = monthly(&[100.0, 110.0, 99.0, 108.9]);
        let expected = volatility(&snaps);
        snaps.reverse();
        assert!((volatility(&snaps) - expected).abs() < 1e-12);
    }

    #[test]
    fn zero_value_periods_are_skipped() {
        let snaps = monthly(&[0.0, 100.0, 110.0]);
        assert_eq!(periodic_returns(&snaps), vec![0.1]);
    }

    #[test]
    fn sharpe_ratio_formula() {
        assert!((sharpe_ratio(0.12, 0.2, 0.02) - 0.5).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn moic_is_scale_invariant(
            invested in 1.0f64..1e6,
            returned in 0.0f64..1e7,
            scale in 0.01f64..100.0,
        ) {
            let flows = [CashFlow::new(day(0), -invested), CashFlow::new(day(400), returned)];
            let scaled = [CashFlow::new(day(0), -invested * scale), CashFlow::new(day(400), returned * scale)];
            prop_assert!((moic(&flows) - moic(&scaled)).abs() < 1e-9 * moic(&flows).max(1.0));
        }

        #[test]
        fn total_return_is_moic_minus_one(
            amounts in proptest::collection::vec(-1e5f64..1e5, 1..12),
        ) {
            let flows: Vec<_> = amounts
                .iter()
                .enumerate()
                .map(|(i, a)| CashFlow::new(day(i as i64 * 30), *a))
                .collect();
            let series = CashFlowSeries::from_unsorted(flows);
            let flows = series.as_slice();
            if total_invested(flows) > 0.0 {
                let tolerance = 1e-9 * moic(flows).max(1.0);
                prop_assert!((total_return(flows) - (moic(flows) - 1.0)).abs() < tolerance);
            } else {
                prop_assert_eq!(total_return(flows), 0.0);
            }
        }
    }
}
