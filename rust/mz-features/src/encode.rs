//! Sparse feature encoding boundary.

use mz_core::PlayerId;

use crate::context::SessionContext;

/// Encodes a position, from the POV of `player`, into sparse feature indices
/// over the session's append-only feature vocabulary.
pub trait FeatureEncoder<S>: Send + Sync {
    fn encode(&self, state: &S, player: PlayerId, ctx: &SessionContext) -> Vec<i64>;
}

/// Helper for encoders: intern each named feature and return indices sorted
/// and deduplicated, which is the canonical form sent over the wire.
pub fn intern_features<I, K>(ctx: &SessionContext, names: I) -> Vec<i64>
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let mut out: Vec<i64> = names
        .into_iter()
        .map(|k| ctx.features().intern(k.as_ref()))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}
