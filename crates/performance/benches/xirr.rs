use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use angelhub_performance::{CashFlow, CashFlowSeries, PerformanceCalculator, ValueSnapshot, XirrSolver};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
}

/// Quarterly capital calls for the first half, distributions after, plus a valuation.
fn synthetic_series(flows: usize) -> CashFlowSeries {
    let half = flows / 2;
    let mut out: Vec<CashFlow> = (0..flows)
        .map(|i| {
            let amount = if i < half { -1_000.0 } else { 1_350.0 };
            CashFlow::new(day(i as i64 * 91), amount)
        })
        .collect();
    out.push(CashFlow::valuation(day(flows as i64 * 91), 2_500.0));
    CashFlowSeries::from_unsorted(out)
}

fn bench_xirr(c: &mut Criterion) {
    let solver = XirrSolver::default();
    let mut group = c.benchmark_group("xirr_solve");

    for size in [2usize, 10, 50, 200] {
        let series = synthetic_series(size);
        group.throughput(Throughput::Elements(series.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &series, |b, series| {
            b.iter(|| solver.solve(black_box(series.as_slice())))
        });
    }
    group.finish();
}

fn bench_full_calculation(c: &mut Criterion) {
    let calc = PerformanceCalculator::new();
    let series = synthetic_series(40);
    let snapshots: Vec<_> = (0..60)
        .map(|i| ValueSnapshot::new(day(i * 30), 10_000.0 + (i as f64 * 0.7).sin() * 800.0))
        .collect();

    c.bench_function("calculate_portfolio_performance", |b| {
        b.iter(|| calc.calculate_portfolio_performance(black_box(&series), black_box(&snapshots), None))
    });
}

criterion_group!(benches, bench_xirr, bench_full_calculation);
criterion_main!(benches);
