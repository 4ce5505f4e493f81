use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use pulse_xtab::lowess::{lowess, LowessOptions};

fn noisy_series(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut rng = SmallRng::seed_from_u64(11);
    let x: Vec<f64> = (1..=n).map(|week| week as f64).collect();
    let y = x
        .iter()
        .map(|week| 0.4 + 0.1 * (week / 8.0).sin() + rng.gen_range(-0.03..0.03))
        .collect();
    (x, y)
}

fn bench_lowess(c: &mut Criterion) {
    let mut group = c.benchmark_group("lowess");
    // Weekly series top out at a few dozen points; the larger sizes show scaling.
    for n in [20_usize, 60, 250, 1000] {
        let (x, y) = noisy_series(n);
        group.throughput(Throughput::Elements(n as u64));
        for (label, options) in [
            ("span 0.2", LowessOptions { frac: 0.2, iterations: 3 }),
            ("span 2/3", LowessOptions::default()),
        ] {
            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, _| {
                b.iter(|| black_box(lowess(&x, &y, &options).unwrap()));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_lowess);
criterion_main!(benches);
