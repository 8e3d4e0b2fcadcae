use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use mz_core::{PlayerId, SearchConfig};
use mz_duel::{Duel, DuelState};
use mz_features::SessionContext;
use mz_mcts::{Budget, HeuristicEvaluator, HeuristicFn, LeafEvaluator, SearchTree, SearchWorker};

fn heuristic() -> Arc<dyn LeafEvaluator<DuelState>> {
    let duel = Duel::default();
    let f: Arc<HeuristicFn<DuelState>> =
        Arc::new(move |s: &DuelState, p: PlayerId| duel.heuristic(s, p));
    Arc::new(HeuristicEvaluator::new(f))
}

fn searched_tree(sims: u64) -> SearchTree<DuelState> {
    let duel = Arc::new(Duel::default());
    let tree = SearchTree::new(&*duel, duel.initial_state(), 0);
    SearchWorker::new(
        duel,
        heuristic(),
        Arc::new(SessionContext::new()),
        SearchConfig::default(),
        tree,
        1,
        Arc::new(AtomicBool::new(false)),
    )
    .run(Budget::simulations(sims, Duration::from_secs(60)))
    .unwrap()
    .tree
}

fn bench_select(c: &mut Criterion) {
    let tree = searched_tree(2_000);
    let root = tree.root();
    c.bench_function("mz_mcts_select_root", |b| {
        b.iter(|| black_box(tree.select(black_box(root), black_box(1.4))))
    });
}

fn bench_simulations(c: &mut Criterion) {
    c.bench_function("mz_mcts_worker_256_sims", |b| {
        b.iter(|| black_box(searched_tree(256).root_node().visits))
    });
}

fn bench_merge(c: &mut Criterion) {
    let a = searched_tree(1_000);
    let b_tree = searched_tree(1_000);
    c.bench_function("mz_mcts_merge_two_workers", |b| {
        b.iter(|| {
            let mut canonical = SearchTree::from_root_node(a.root_node(), 0);
            canonical.merge(black_box(&a));
            black_box(canonical.merge(black_box(&b_tree)))
        })
    });
}

criterion_group!(benches, bench_select, bench_simulations, bench_merge);
criterion_main!(benches);
