use criterion::{criterion_group, BatchSize, Criterion};
use retrystorm_cluster::{
    metrics::Metrics,
    router::{Config, Router},
    Ingress, Request, UserId,
};

fn bench_rebalance(c: &mut Criterion) {
    for users in [1_000, 100_000] {
        for servers in [4, 64] {
            let label = format!("{}/users={} servers={}", module_path!(), users, servers);
            c.bench_function(&label, |b| {
                b.iter_batched(
                    || {
                        let cfg = Config {
                            servers,
                            max_process_queue_len: 0,
                            queue_len_limit: usize::MAX,
                            ..Config::default()
                        };
                        let mut router = Router::new(cfg, Metrics::default()).unwrap();
                        router.register((0..users).map(UserId)).unwrap();

                        // Load the first server so it is always the victim
                        router.route(0, Request::new(UserId(0), 0, 0)).unwrap();
                        router
                    },
                    |mut router| router.rebalance(0).unwrap(),
                    BatchSize::LargeInput,
                );
            });
        }
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_rebalance
}
