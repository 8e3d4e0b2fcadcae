//! Search against a live (in-process) inference server.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use mz_core::{Config, InferenceConfig, Oracle};
use mz_duel::{Duel, DuelEncoder, DuelState};
use mz_features::SessionContext;
use mz_infer::server;
use mz_infer::{BatchRequest, ClientOptions, EvaluationResult, InferenceClient};
use mz_mcts::{
    build_evaluator, Budget, EvaluatorChoice, HeuristicFn, LeafEvaluator, ParallelCoordinator,
    RemoteEvaluator, SearchTree, SearchWorker,
};

fn remote(addr: &str, opts: ClientOptions) -> Arc<dyn LeafEvaluator<DuelState>> {
    let client = InferenceClient::connect(addr, opts).unwrap();
    Arc::new(RemoteEvaluator::<DuelState>::new(
        Arc::new(DuelEncoder),
        Arc::new(client),
    ))
}

fn run_worker(
    evaluator: Arc<dyn LeafEvaluator<DuelState>>,
    n: u64,
) -> mz_mcts::WorkerOutcome<DuelState> {
    let duel = Arc::new(Duel::default());
    let tree = SearchTree::new(&*duel, duel.initial_state(), 0);
    SearchWorker::new(
        duel,
        evaluator,
        Arc::new(SessionContext::new()),
        mz_core::SearchConfig::default(),
        tree,
        9,
        Arc::new(AtomicBool::new(false)),
    )
    .run(Budget::simulations(n, Duration::from_secs(10)))
    .unwrap()
}

#[test]
fn async_worker_settles_every_evaluation() {
    let addr = server::spawn("127.0.0.1:0", server::hash_handler).unwrap();
    let evaluator = remote(&addr.to_string(), ClientOptions::default());
    let out = run_worker(Arc::clone(&evaluator), 64);

    assert_eq!(out.stats.simulations, 64);
    assert_eq!(out.stats.abandoned, 0);
    assert!(out.stats.dispatched > 0);
    assert_eq!(out.stats.completed, out.stats.dispatched);
    assert!(out.stats.inflight_max > 1);
    assert_eq!(out.tree.root_node().visits, 64);
    assert!(out.tree.mass_conserved());
    assert!(!out.tree.has_in_flight());

    let stats = evaluator.client_stats().unwrap();
    assert_eq!(stats.inflight, 0);
    assert!(stats.calls < out.stats.dispatched, "requests were batched");
}

#[test]
fn failed_evaluations_leave_no_pending_state() {
    let addr = server::spawn("127.0.0.1:0", |_b: &BatchRequest| {
        Err::<Vec<EvaluationResult>, String>("model unavailable".to_string())
    })
    .unwrap();
    let out = run_worker(remote(&addr.to_string(), ClientOptions::default()), 24);

    assert!(out.stats.failed > 0);
    assert_eq!(out.stats.completed, 0);
    assert!(!out.tree.has_in_flight());
    assert!(out.tree.mass_conserved());
    let root = out.tree.root();
    for id in out.tree.subtree(root) {
        assert!(!out.tree.node(id).evaluation_pending);
    }
}

#[test]
fn non_finite_values_back_up_as_neutral() {
    let addr = server::spawn("127.0.0.1:0", |b: &BatchRequest| {
        Ok(vec![EvaluationResult::value_only(f32::NAN); b.len()])
    })
    .unwrap();
    let out = run_worker(remote(&addr.to_string(), ClientOptions::default()), 32);

    assert!(out.stats.failed > 0);
    assert_eq!(out.stats.completed, 0);
    let root = out.tree.root_node();
    assert!(root.score.is_finite());
    assert!(out.tree.root_value().is_finite());
    assert!(out.tree.mass_conserved());
    assert!(!out.tree.has_in_flight());
}

#[test]
fn unreachable_server_degrades_to_offline() {
    // Bind then drop to get a port nothing listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let cfg = InferenceConfig {
        addr: Some(format!("127.0.0.1:{port}")),
        connect_timeout_ms: 200,
        ..InferenceConfig::default()
    };
    let duel = Duel::default();
    let heuristic: Arc<HeuristicFn<DuelState>> =
        Arc::new(move |s: &DuelState, p| duel.heuristic(s, p));
    let evaluator = build_evaluator(
        &EvaluatorChoice::from_config(&cfg),
        Arc::new(DuelEncoder),
        heuristic,
    );
    assert_eq!(evaluator.name(), "local-model");
}

#[test]
fn coordinator_plays_a_game_over_the_wire() {
    let addr = server::spawn("127.0.0.1:0", server::hash_handler).unwrap();
    let mut cfg = Config::default();
    cfg.coordinator.workers = 2;
    cfg.coordinator.base_think_ms = 10;
    cfg.coordinator.max_think_ms = 40;
    cfg.search.noise_seed = Some(5);
    cfg.inference.addr = Some(addr.to_string());

    let duel = Arc::new(Duel::new(6, 6));
    let heuristic: Arc<HeuristicFn<DuelState>> = {
        let duel = Arc::clone(&duel);
        Arc::new(move |s: &DuelState, p| duel.heuristic(s, p))
    };
    let evaluator = build_evaluator(
        &EvaluatorChoice::from_config(&cfg.inference),
        Arc::new(DuelEncoder),
        heuristic,
    );
    assert_eq!(evaluator.name(), "remote");

    let mut coord = ParallelCoordinator::new(
        Arc::clone(&duel),
        evaluator,
        Arc::new(SessionContext::new()),
        &cfg,
        duel.initial_state(),
        0,
    )
    .unwrap();

    let mut plies = 0;
    while !duel.is_terminal(coord.state()) {
        let d = coord.decide().unwrap();
        assert!(duel.legal_actions(coord.state()).contains(&d.action));
        coord.advance(&d.action).unwrap();
        assert!(!coord.tree().has_in_flight());
        plies += 1;
        assert!(plies < 500, "game did not finish");
    }
    assert!(coord.client_stats().unwrap().calls > 0);
}
