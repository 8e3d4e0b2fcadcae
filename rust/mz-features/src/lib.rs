//! mz-features: sparse feature encoding and the session vocabulary context.

pub mod context;
pub mod encode;
pub mod vocab;

pub use context::SessionContext;
pub use encode::{intern_features, FeatureEncoder};
pub use vocab::Vocabulary;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use mz_core::ActionLabel;

    #[test]
    fn version_is_nonempty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn interned_features_are_sorted_and_unique() {
        let ctx = SessionContext::new();
        ctx.features().intern("warmup");
        let idx = intern_features(&ctx, ["life:3", "hand:2", "life:3"]);
        assert_eq!(idx, vec![1, 2]);
    }

    #[test]
    fn action_vocabulary_is_separate_from_features() {
        let ctx = SessionContext::new();
        ctx.features().intern("x");
        ctx.features().intern("y");
        assert_eq!(ctx.action_index(&ActionLabel::Target(3)), 0);
        assert_eq!(ctx.action_index(&ActionLabel::Boolean(true)), 1);
        assert_eq!(ctx.action_index(&ActionLabel::Target(3)), 0);
    }
}
