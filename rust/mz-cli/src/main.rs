//! mz: command line for the parallel search engine.
//!
//! Subcommands:
//! - play          self-play games of the reference duel
//! - dummy-infer   serve deterministic evaluations over the inference protocol
//! - config        print the effective configuration

use std::env;
use std::net::TcpListener;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use mz_core::{Config, Oracle, PlayerId};
use mz_duel::{Duel, DuelEncoder, DuelState};
use mz_features::SessionContext;
use mz_infer::client::ClientStatsSnapshot;
use mz_logging::{
    DecisionEventV1, GameEndEventV1, InferStatsV1, NdjsonWriter, PolicySummaryV1, VersionInfoV1,
};
use mz_mcts::{build_evaluator, Decision, EvaluatorChoice, HeuristicFn, ParallelCoordinator};

fn print_help() {
    eprintln!(
        r#"mz - parallel PUCT search

USAGE:
    mz <COMMAND> [OPTIONS]

COMMANDS:
    play            Self-play games of the reference duel
    dummy-infer     Run a deterministic inference server
    config          Print the effective configuration as YAML

OPTIONS:
    -h, --help          Print this help message
    -V, --version       Print version

Run `mz <COMMAND> --help` for command options.
"#
    );
}

fn print_version() {
    println!("mz {}", env!("CARGO_PKG_VERSION"));
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    args.get(i + 1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| {
            eprintln!("Invalid {flag} value");
            process::exit(1);
        })
}

fn load_config(path: Option<&str>) -> Config {
    match path {
        Some(p) => Config::load(p).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            process::exit(1);
        }),
        None => Config::default(),
    }
}

fn init_logging(level: &str) {
    let Some(filter) = mz_logging::parse_level(level) else {
        eprintln!("Unknown log level: {level}");
        process::exit(1);
    };
    if mz_logging::init_terminal(filter).is_err() {
        eprintln!("Logger already initialized");
    }
}

fn infer_stats(s: &ClientStatsSnapshot) -> InferStatsV1 {
    InferStatsV1 {
        inflight: s.inflight as u64,
        queued: s.queued as u64,
        submitted: s.submitted,
        calls: s.calls,
        results: s.results,
        errors: s.errors,
        timeouts: s.timeouts,
        max_inflight: s.max_inflight as u64,
        latency_p50_us: s.latency.p50_us,
        latency_p95_us: s.latency.p95_us,
        latency_mean_us: s.latency.mean_us,
    }
}

struct PlayArgs {
    config: Option<String>,
    games: u64,
    seed: u64,
    infer: Option<String>,
    evaluator: Option<String>,
    events: Option<String>,
    max_turns: Option<u16>,
    log_level: Option<String>,
    run_id: String,
}

fn parse_play_args(args: &[String]) -> PlayArgs {
    let mut out = PlayArgs {
        config: None,
        games: 1,
        seed: 0,
        infer: None,
        evaluator: None,
        events: None,
        max_turns: None,
        log_level: None,
        run_id: format!("run-{}", mz_logging::now_ms()),
    };
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                println!(
                    r#"mz play

USAGE:
    mz play [--config cfg.yaml] [--games N] [--seed S] [--infer HOST:PORT]
            [--evaluator heuristic|local|remote] [--events out.ndjson]

OPTIONS:
    --config PATH        YAML config (defaults apply when omitted)
    --games N            Number of games (default: 1)
    --seed S             Opening seed; game g starts from seed+g (default: 0)
    --infer ADDR         Inference server "host:port"; overrides config
    --evaluator KIND     heuristic, local or remote (default: remote if an address is set, else local)
    --events PATH        Append decision events as NDJSON; overrides config
    --max-turns N        Turn cap per game (default: 20)
    --log-level LEVEL    error|warn|info|debug|trace; overrides config
    --run-id ID          Run id stamped on events
"#
                );
                process::exit(0);
            }
            "--config" => {
                out.config = Some(parse_value(args, i, "--config"));
                i += 2;
            }
            "--games" => {
                out.games = parse_value(args, i, "--games");
                i += 2;
            }
            "--seed" => {
                out.seed = parse_value(args, i, "--seed");
                i += 2;
            }
            "--infer" => {
                out.infer = Some(parse_value(args, i, "--infer"));
                i += 2;
            }
            "--evaluator" => {
                out.evaluator = Some(parse_value(args, i, "--evaluator"));
                i += 2;
            }
            "--events" => {
                out.events = Some(parse_value(args, i, "--events"));
                i += 2;
            }
            "--max-turns" => {
                out.max_turns = Some(parse_value(args, i, "--max-turns"));
                i += 2;
            }
            "--log-level" => {
                out.log_level = Some(parse_value(args, i, "--log-level"));
                i += 2;
            }
            "--run-id" => {
                out.run_id = parse_value(args, i, "--run-id");
                i += 2;
            }
            other => {
                eprintln!("Unknown option for `mz play`: {other}");
                eprintln!("Run `mz play --help` for usage.");
                process::exit(1);
            }
        }
    }
    out
}

fn cmd_play(args: &[String]) {
    let pa = parse_play_args(args);
    let mut cfg = load_config(pa.config.as_deref());
    if let Some(addr) = &pa.infer {
        cfg.inference.addr = Some(addr.clone());
    }
    if let Some(path) = &pa.events {
        cfg.logging.events_path = Some(path.clone());
    }
    if let Some(level) = &pa.log_level {
        cfg.logging.level = level.clone();
    }
    init_logging(&cfg.logging.level);

    let choice = match pa.evaluator.as_deref() {
        None => EvaluatorChoice::from_config(&cfg.inference),
        Some("heuristic") => EvaluatorChoice::Heuristic,
        Some("local") => EvaluatorChoice::LocalModel,
        Some("remote") => EvaluatorChoice::Remote(cfg.inference.clone()),
        Some(other) => {
            eprintln!("Unknown evaluator: {other}");
            process::exit(1);
        }
    };

    let duel = Arc::new(Duel {
        max_turns: pa.max_turns.unwrap_or(Duel::default().max_turns),
        ..Duel::default()
    });
    let heuristic: Arc<HeuristicFn<DuelState>> = {
        let duel = Arc::clone(&duel);
        Arc::new(move |s: &DuelState, p| duel.heuristic(s, p))
    };
    let evaluator = build_evaluator(&choice, Arc::new(DuelEncoder), heuristic);
    log::info!("evaluator: {}", evaluator.name());

    let mut events = cfg.logging.events_path.as_ref().map(|p| {
        NdjsonWriter::open_append_with_flush(p, 1).unwrap_or_else(|e| {
            eprintln!("Failed to open events file {p}: {e}");
            process::exit(1);
        })
    });

    let ctx = Arc::new(SessionContext::new());
    let mut wins = [0u64; 2];
    let mut draws = 0u64;
    for game_id in 0..pa.games {
        let start = duel.random_start(pa.seed.wrapping_add(game_id));
        let t0 = Instant::now();
        let mut seats: Vec<ParallelCoordinator<Duel>> = (0..2u8)
            .map(|p| {
                ParallelCoordinator::new(
                    Arc::clone(&duel),
                    Arc::clone(&evaluator),
                    Arc::clone(&ctx),
                    &cfg,
                    start.clone(),
                    p,
                )
                .unwrap_or_else(|e| {
                    eprintln!("Failed to build search: {e}");
                    process::exit(1);
                })
            })
            .collect();

        let mut state = start;
        let mut ply = 0u32;
        while !duel.is_terminal(&state) {
            let player = duel.to_play(&state);
            let d = seats[player as usize].decide().unwrap_or_else(|e| {
                eprintln!("Search failed at ply {ply}: {e}");
                process::exit(1);
            });
            if let Some(w) = events.as_mut() {
                let ev = decision_event(&pa.run_id, game_id, ply, player, &d, &seats[player as usize]);
                if let Err(e) = w.write_event(&ev) {
                    log::warn!("dropping decision event: {e}");
                }
            }
            log::debug!("game {game_id} ply {ply}: player {player} plays {}", d.action);
            for seat in seats.iter_mut() {
                seat.advance(&d.action).unwrap_or_else(|e| {
                    eprintln!("Failed to advance search: {e}");
                    process::exit(1);
                });
            }
            state = duel.apply(&state, &d.action).unwrap_or_else(|e| {
                eprintln!("Engine rejected {}: {e}", d.action);
                process::exit(1);
            });
            ply += 1;
        }

        let winner = duel.winner(&state);
        match winner {
            Some(w) => wins[w as usize] += 1,
            None => draws += 1,
        }
        log::info!(
            "game {game_id}: {} after {ply} plies ({:.1}s)",
            winner.map_or("draw".to_string(), |w| format!("player {w} wins")),
            t0.elapsed().as_secs_f32()
        );
        if let Some(w) = events.as_mut() {
            let ev = GameEndEventV1 {
                event: "game_end",
                ts_ms: mz_logging::now_ms(),
                v: VersionInfoV1::new(mz_infer::protocol::PROTOCOL_VERSION),
                run_id: pa.run_id.clone(),
                game_id,
                plies: ply,
                winner,
                wall_ms: t0.elapsed().as_millis() as u64,
            };
            if let Err(e) = w.write_event(&ev) {
                log::warn!("dropping game event: {e}");
            }
        }
    }

    println!(
        "games={} p0_wins={} p1_wins={} draws={} evaluations={} simulations={}",
        pa.games,
        wins[0],
        wins[1],
        draws,
        ctx.evaluations(),
        ctx.simulations()
    );
}

fn decision_event(
    run_id: &str,
    game_id: u64,
    ply: u32,
    player: PlayerId,
    d: &Decision,
    coord: &ParallelCoordinator<Duel>,
) -> DecisionEventV1 {
    DecisionEventV1 {
        event: "decision",
        ts_ms: mz_logging::now_ms(),
        v: VersionInfoV1::new(mz_infer::protocol::PROTOCOL_VERSION),
        run_id: run_id.to_string(),
        game_id,
        ply,
        player,
        decision: format!("{:?}", d.decision),
        action: d.action.to_string(),
        budget_ms: d.budget.as_millis() as u64,
        elapsed_ms: d.elapsed.as_millis() as u64,
        root_visits: d.root_visits,
        root_children: d.root_children,
        root_value: d.root_value,
        simulations: d.simulations,
        workers_merged: d.workers_merged,
        workers_failed: d.workers_failed,
        workers_late: d.workers_late,
        policy: PolicySummaryV1::from_labelled(&d.policy),
        infer: coord.client_stats().as_ref().map(infer_stats),
    }
}

fn cmd_dummy_infer(args: &[String]) {
    let mut bind = "127.0.0.1:7878".to_string();
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                println!(
                    r#"mz dummy-infer

USAGE:
    mz dummy-infer [--bind HOST:PORT]

Answers every evaluation with values and logits hashed from the feature
indices. Useful for exercising the client without a model.
"#
                );
                return;
            }
            "--bind" => {
                bind = parse_value(args, i, "--bind");
                i += 2;
            }
            other => {
                eprintln!("Unknown option for `mz dummy-infer`: {other}");
                process::exit(1);
            }
        }
    }
    init_logging("info");
    let listener = TcpListener::bind(&bind).unwrap_or_else(|e| {
        eprintln!("Failed to bind {bind}: {e}");
        process::exit(1);
    });
    match listener.local_addr() {
        Ok(a) => println!("listening on {a}"),
        Err(_) => println!("listening on {bind}"),
    }
    if let Err(e) = mz_infer::server::serve(listener, mz_infer::server::hash_handler) {
        eprintln!("Server stopped: {e}");
        process::exit(1);
    }
}

fn cmd_config(args: &[String]) {
    let mut path: Option<String> = None;
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                path = Some(parse_value(args, i, "--config"));
                i += 2;
            }
            other => {
                eprintln!("Unknown option for `mz config`: {other}");
                process::exit(1);
            }
        }
    }
    let cfg = load_config(path.as_deref());
    match serde_yaml::to_string(&cfg) {
        Ok(s) => print!("{s}"),
        Err(e) => {
            eprintln!("Failed to render config: {e}");
            process::exit(1);
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_help();
        process::exit(1);
    }
    match args[1].as_str() {
        "-h" | "--help" | "help" => print_help(),
        "-V" | "--version" => print_version(),
        "play" => cmd_play(&args[2..]),
        "dummy-infer" => cmd_dummy_infer(&args[2..]),
        "config" => cmd_config(&args[2..]),
        cmd => {
            eprintln!("Unknown command: {cmd}");
            eprintln!("Run `mz --help` for usage.");
            process::exit(1);
        }
    }
}
