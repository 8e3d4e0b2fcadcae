//! Per-session context threaded through search worker construction.

use std::sync::atomic::{AtomicU64, Ordering};

use mz_core::ActionLabel;

use crate::vocab::Vocabulary;

/// State shared by every worker of one session: the feature vocabulary, the
/// action vocabulary used to index policy vectors, and session counters.
#[derive(Debug, Default)]
pub struct SessionContext {
    features: Vocabulary,
    actions: Vocabulary,
    simulations: AtomicU64,
    evaluations: AtomicU64,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn features(&self) -> &Vocabulary {
        &self.features
    }

    pub fn actions(&self) -> &Vocabulary {
        &self.actions
    }

    /// Policy index of an action label, interning it on first use.
    pub fn action_index(&self, label: &ActionLabel) -> i64 {
        self.actions.intern(&label.key())
    }

    pub fn record_simulation(&self) {
        self.simulations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn simulations(&self) -> u64 {
        self.simulations.load(Ordering::Relaxed)
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }
}
