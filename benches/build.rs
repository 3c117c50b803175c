use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use bangfile::Engine;

fn synthetic_tuples(n: usize) -> Vec<[f64; 2]> {
    // A 100x100 grid of clumps, each jittered slightly, so the directory
    // actually has to split and redistribute rather than settling into a
    // single bucket.
    (0..n)
        .map(|i| {
            let cell = (i % 10_000) as f64;
            let row = (cell / 100.0).floor();
            let col = cell % 100.0;
            let jitter = ((i / 10_000) as f64) * 0.0005;
            (
                (col + 0.5) / 100.0 + jitter,
                (row + 0.5) / 100.0 + jitter,
            )
        })
        .map(|(x, y)| [x.min(0.999), y.min(0.999)])
        .collect()
}

fn build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group
        .significance_level(0.05)
        .measurement_time(std::time::Duration::new(10, 0));

    for &n in &[1_000usize, 10_000] {
        let tuples = synthetic_tuples(n);
        group.bench_function(format!("insert-and-build-{n}"), |b| {
            b.iter_with_large_drop(|| {
                let mut engine = Engine::new(2, 100, 1, 50).unwrap();
                for t in &tuples {
                    engine.insert(t).unwrap();
                }
                engine.build();
                engine
            })
        });
    }

    group.finish();
}

criterion_group!(benches, build);
criterion_main!(benches);
