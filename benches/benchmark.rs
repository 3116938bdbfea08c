use criterion::{criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use cosmotion::data::{Interaction, Interactions};
use cosmotion::evaluation::auc_at_k;
use cosmotion::models::factorization::BprFactorizer;
use cosmotion::models::{Factorizer, HyperparameterConfig, TrainerOptions};

fn synthetic(num_users: usize, num_items: usize, sample_size: usize) -> Interactions {
    let mut rng = XorShiftRng::seed_from_u64(42);
    let interactions = (0..sample_size)
        .map(|_| {
            Interaction::new(
                rng.gen_range(0..num_users),
                rng.gen_range(0..num_items),
                1.0,
            )
        })
        .collect();

    Interactions::from_parts(num_users, num_items, interactions)
}

fn bench_bpr(c: &mut Criterion) {
    let data = synthetic(2000, 1000, 20_000).to_compressed();
    let config = HyperparameterConfig::new(32, 1, 0.01, 0.05).unwrap();

    for &num_threads in &[1, 4] {
        let trainer = BprFactorizer::new(
            TrainerOptions::default()
                .num_threads(num_threads)
                .seed(1),
        );

        c.bench_function(&format!("bpr_{}_threads", num_threads), |b| {
            b.iter(|| trainer.fit(&data, &config).unwrap())
        });
    }
}

fn bench_auc(c: &mut Criterion) {
    let data = synthetic(2000, 1000, 20_000).to_compressed();
    let config = HyperparameterConfig::new(32, 1, 0.01, 0.05).unwrap();
    let model = BprFactorizer::new(TrainerOptions::default().seed(1))
        .fit(&data, &config)
        .unwrap();

    c.bench_function("auc_at_k", |b| {
        b.iter(|| auc_at_k(&model, &data, &data, 50).unwrap())
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_bpr, bench_auc
}
criterion_main!(benches);
