//! Leaf evaluation strategies.
//!
//! One [`LeafEvaluator`] is chosen when the search is built: a static
//! heuristic, an in-process model over sparse features, or the remote
//! inference service reached through [`InferenceClient`]. The first two
//! answer immediately; the remote one hands back a [`Ticket`] that the
//! worker drains later.

use std::sync::Arc;
use std::time::Duration;

use mz_core::{DecisionKind, InferenceConfig, PlayerId};
use mz_features::{FeatureEncoder, SessionContext};
use mz_infer::client::ClientStatsSnapshot;
use mz_infer::{BatchRequest, ClientError, ClientOptions, EvaluationResult, InferenceClient, Ticket};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("inference client: {0}")]
    Client(#[from] ClientError),
    #[error("local model: {0}")]
    Model(String),
}

/// Outcome of dispatching one leaf.
#[derive(Debug)]
pub enum Evaluation {
    /// Value (searching player's POV) and optional policies, available now.
    Ready(EvaluationResult),
    /// Result will arrive on the ticket.
    Pending(Ticket),
}

pub trait LeafEvaluator<S>: Send + Sync {
    /// Evaluate `state` from `perspective`'s point of view.
    fn evaluate(
        &self,
        state: &S,
        perspective: PlayerId,
        ctx: &SessionContext,
    ) -> Result<Evaluation, EvalError>;

    /// Block until some pending evaluation may have completed, or `timeout`.
    fn wait_for_progress(&self, _timeout: Duration) {}

    fn name(&self) -> &'static str;

    fn client_stats(&self) -> Option<ClientStatsSnapshot> {
        None
    }
}

pub type HeuristicFn<S> = dyn Fn(&S, PlayerId) -> f32 + Send + Sync;

/// Position → scalar, no policy.
pub struct HeuristicEvaluator<S> {
    f: Arc<HeuristicFn<S>>,
}

impl<S> HeuristicEvaluator<S> {
    pub fn new(f: Arc<HeuristicFn<S>>) -> Self {
        Self { f }
    }
}

impl<S> LeafEvaluator<S> for HeuristicEvaluator<S> {
    fn evaluate(
        &self,
        state: &S,
        perspective: PlayerId,
        _ctx: &SessionContext,
    ) -> Result<Evaluation, EvalError> {
        let v = (self.f)(state, perspective);
        if !v.is_finite() {
            return Err(EvalError::Model(format!("heuristic returned {v}")));
        }
        let v = v.clamp(-1.0, 1.0);
        Ok(Evaluation::Ready(EvaluationResult::value_only(v)))
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

/// In-process scorer over sparse feature indices.
pub trait LocalModel: Send + Sync {
    fn score(&self, indices: &[i64]) -> Result<EvaluationResult, EvalError>;
}

/// Deterministic stand-in model; scores exactly like the bundled dummy
/// inference server, so offline and remote runs agree.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashModel;

impl LocalModel for HashModel {
    fn score(&self, indices: &[i64]) -> Result<EvaluationResult, EvalError> {
        let batch = BatchRequest::from_samples(&[indices]);
        mz_infer::server::hash_handler(&batch)
            .map_err(EvalError::Model)?
            .pop()
            .ok_or_else(|| EvalError::Model("empty result".to_string()))
    }
}

pub struct LocalModelEvaluator<S> {
    encoder: Arc<dyn FeatureEncoder<S>>,
    model: Arc<dyn LocalModel>,
}

impl<S> LocalModelEvaluator<S> {
    pub fn new(encoder: Arc<dyn FeatureEncoder<S>>, model: Arc<dyn LocalModel>) -> Self {
        Self { encoder, model }
    }
}

impl<S> LeafEvaluator<S> for LocalModelEvaluator<S> {
    fn evaluate(
        &self,
        state: &S,
        perspective: PlayerId,
        ctx: &SessionContext,
    ) -> Result<Evaluation, EvalError> {
        let indices = self.encoder.encode(state, perspective, ctx);
        ctx.record_evaluation();
        Ok(Evaluation::Ready(self.model.score(&indices)?))
    }

    fn name(&self) -> &'static str {
        "local-model"
    }
}

pub struct RemoteEvaluator<S> {
    encoder: Arc<dyn FeatureEncoder<S>>,
    client: Arc<InferenceClient>,
}

impl<S> RemoteEvaluator<S> {
    pub fn new(encoder: Arc<dyn FeatureEncoder<S>>, client: Arc<InferenceClient>) -> Self {
        Self { encoder, client }
    }

    pub fn client(&self) -> &InferenceClient {
        &self.client
    }
}

impl<S> LeafEvaluator<S> for RemoteEvaluator<S> {
    fn evaluate(
        &self,
        state: &S,
        perspective: PlayerId,
        ctx: &SessionContext,
    ) -> Result<Evaluation, EvalError> {
        let indices = self.encoder.encode(state, perspective, ctx);
        ctx.record_evaluation();
        Ok(Evaluation::Pending(self.client.submit(indices)?))
    }

    fn wait_for_progress(&self, timeout: Duration) {
        self.client.wait_for_progress(timeout);
    }

    fn name(&self) -> &'static str {
        "remote"
    }

    fn client_stats(&self) -> Option<ClientStatsSnapshot> {
        Some(self.client.stats_snapshot())
    }
}

/// The policy sub-vector that applies at a node.
///
/// Yes/no decisions use `policy_binary`, target picks `policy_target`;
/// anything else uses the acting player's action policy (`policy_player`
/// when the searching player acts, `policy_opponent` otherwise, falling
/// back to `policy_player`).
pub fn select_policy(
    result: &EvaluationResult,
    decision: DecisionKind,
    to_play: PlayerId,
    perspective: PlayerId,
) -> Option<&[f32]> {
    let v = match decision {
        DecisionKind::Binary => result.policy_binary.as_ref(),
        DecisionKind::Target => result
            .policy_target
            .as_ref()
            .or(result.policy_player.as_ref()),
        _ if to_play == perspective => result.policy_player.as_ref(),
        _ => result
            .policy_opponent
            .as_ref()
            .or(result.policy_player.as_ref()),
    };
    v.map(Vec::as_slice)
}

/// Which evaluator to build.
#[derive(Debug, Clone)]
pub enum EvaluatorChoice {
    Heuristic,
    LocalModel,
    Remote(InferenceConfig),
}

impl EvaluatorChoice {
    /// Remote when an address is configured, local model otherwise.
    pub fn from_config(cfg: &InferenceConfig) -> Self {
        match cfg.addr {
            Some(_) => EvaluatorChoice::Remote(cfg.clone()),
            None => EvaluatorChoice::LocalModel,
        }
    }
}

pub fn client_options(cfg: &InferenceConfig) -> ClientOptions {
    ClientOptions {
        batching: cfg.batching,
        max_batch_size: cfg.max_batch_size,
        flush_interval: Duration::from_micros(cfg.flush_interval_us),
        max_concurrency: cfg.max_concurrency,
        request_timeout: Duration::from_millis(cfg.request_timeout_ms),
        connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
        max_queue: cfg.max_queue,
    }
}

/// Build the chosen evaluator. A remote choice whose connection or health
/// check fails degrades to the local model (offline mode).
pub fn build_evaluator<S: 'static>(
    choice: &EvaluatorChoice,
    encoder: Arc<dyn FeatureEncoder<S>>,
    heuristic: Arc<HeuristicFn<S>>,
) -> Arc<dyn LeafEvaluator<S>> {
    match choice {
        EvaluatorChoice::Heuristic => Arc::new(HeuristicEvaluator::new(heuristic)),
        EvaluatorChoice::LocalModel => {
            Arc::new(LocalModelEvaluator::new(encoder, Arc::new(HashModel)))
        }
        EvaluatorChoice::Remote(cfg) => {
            let Some(addr) = cfg.addr.as_deref() else {
                log::info!("no inference address configured; running offline");
                return Arc::new(LocalModelEvaluator::new(encoder, Arc::new(HashModel)));
            };
            match InferenceClient::connect(addr, client_options(cfg)) {
                Ok(client) => {
                    log::info!("connected to inference server at {addr}");
                    Arc::new(RemoteEvaluator::new(encoder, Arc::new(client)))
                }
                Err(e) => {
                    log::warn!("inference server {addr} unavailable ({e}); running offline");
                    Arc::new(LocalModelEvaluator::new(encoder, Arc::new(HashModel)))
                }
            }
        }
    }
}
