use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kalman_core::{Algorithm, CovarianceFactor, DMat, DVec, Kalman};

/// Drive one smoother over `n` observed steps of a rotating 2-state system.
fn run(algorithm: Algorithm, n: usize) -> DVec {
    let alpha = 2.0 * std::f64::consts::PI / 16.0;
    let f = DMat::from_row_slice(
        2,
        2,
        &[alpha.cos(), -alpha.sin(), alpha.sin(), alpha.cos()],
    );
    let h = DMat::identity(2, 2);
    let g = DMat::identity(2, 2);
    let zero = DVec::zeros(2);
    let kcov = CovarianceFactor::Whitening(DMat::identity(2, 2) * 1e3);
    let ocov = CovarianceFactor::Whitening(DMat::identity(2, 2) * 1e1);

    let mut kalman = Kalman::new(algorithm);
    for i in 0..n {
        if i == 0 {
            kalman.evolve(2, None, None, None, None);
        } else {
            kalman.evolve(2, Some(&h), Some(&f), Some(&zero), Some(&kcov));
        }
        let t = i as f64 * alpha;
        let o = DVec::from_vec(vec![t.cos(), t.sin()]);
        kalman.observe(Some(&g), Some(&o), Some(&ocov));
    }
    kalman.smooth();
    kalman.estimate(0)
}

fn bench_smoothers(c: &mut Criterion) {
    let mut group = c.benchmark_group("smooth");
    for n in [64, 512] {
        for algorithm in [
            Algorithm::Ultimate,
            Algorithm::Conventional,
            Algorithm::Associative,
        ] {
            group.bench_function(format!("{algorithm:?}_{n}_steps"), |b| {
                b.iter(|| black_box(run(algorithm, n)));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_smoothers);
criterion_main!(benches);
