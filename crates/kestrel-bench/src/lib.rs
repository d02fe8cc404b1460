//! Benchmarks for the kestrel runtime live in `benches/`.
//!
//! [`BenchStats`] collects per-sample costs so each bench can print a
//! one-line percentile summary next to criterion's own report.

use std::time::Duration;

#[derive(Debug, Default)]
pub struct BenchStats {
    samples_ns_per_op: Vec<f64>,
    total_iters: u64,
    total_ns: u128,
}

impl BenchStats {
    pub fn record(&mut self, iters: u64, dur: Duration) {
        let ns = dur.as_nanos();
        self.total_iters = self.total_iters.saturating_add(iters);
        self.total_ns = self.total_ns.saturating_add(ns);
        self.samples_ns_per_op.push(ns as f64 / iters.max(1) as f64);
    }

    /// Prints `KESTREL_BENCH group=.. bench=.. p50_ns_op=..` to stdout.
    pub fn report(&self, group: &str, bench: &str) {
        let mut samples = self.samples_ns_per_op.clone();
        if samples.is_empty() {
            return;
        }
        samples.sort_by(f64::total_cmp);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let throughput_ops_s = if self.total_ns == 0 {
            0.0
        } else {
            self.total_iters as f64 / (self.total_ns as f64 / 1e9)
        };
        println!(
            "KESTREL_BENCH group={group} bench={bench} samples={} p50_ns_op={:.3} p95_ns_op={:.3} p99_ns_op={:.3} mean_ns_op={mean:.3} throughput_ops_s={throughput_ops_s:.3}",
            samples.len(),
            percentile_sorted(&samples, 0.50),
            percentile_sorted(&samples, 0.95),
            percentile_sorted(&samples, 0.99),
        );
    }
}

#[must_use]
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    debug_assert!((0.0..=1.0).contains(&p));
    let Some(last) = sorted.len().checked_sub(1) else {
        return 0.0;
    };
    let idx = (last as f64 * p).round() as usize;
    sorted[idx.min(last)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_pick_nearest_rank() {
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile_sorted(&samples, 0.0), 1.0);
        assert_eq!(percentile_sorted(&samples, 0.5), 3.0);
        assert_eq!(percentile_sorted(&samples, 1.0), 5.0);
        assert_eq!(percentile_sorted(&[], 0.5), 0.0);
    }

    #[test]
    fn zero_iteration_samples_do_not_divide_by_zero() {
        let mut stats = BenchStats::default();
        stats.record(0, Duration::from_nanos(10));
        assert_eq!(stats.samples_ns_per_op, vec![10.0]);
    }
}
