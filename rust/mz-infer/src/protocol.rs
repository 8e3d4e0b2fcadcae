//! Protocol v1 definitions for the search ↔ inference server boundary.
//!
//! One network call carries a batch of sparse samples in CSR form: every
//! sample's feature indices concatenated into `indices`, and `offsets[i]`
//! giving the start of sample `i` within it.

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

pub const KEY_INDICES: &str = "indices";
pub const KEY_OFFSETS: &str = "offsets";
pub const KEY_VALUE: &str = "value";
pub const KEY_POLICY_PLAYER: &str = "policy_player";
/// Legacy alias of [`KEY_POLICY_PLAYER`].
pub const KEY_POLICY_LEGACY: &str = "policy";
pub const KEY_POLICY_OPPONENT: &str = "policy_opponent";
pub const KEY_POLICY_TARGET: &str = "policy_target";
pub const KEY_POLICY_BINARY: &str = "policy_binary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Health = 1,
    HealthOk = 2,
    Evaluate = 3,
    Result = 4,
    Error = 5,
}

impl MsgKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(MsgKind::Health),
            2 => Some(MsgKind::HealthOk),
            3 => Some(MsgKind::Evaluate),
            4 => Some(MsgKind::Result),
            5 => Some(MsgKind::Error),
            _ => None,
        }
    }
}

/// A batch of sparse samples in CSR form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRequest {
    pub indices: Vec<i64>,
    pub offsets: Vec<i64>,
}

impl BatchRequest {
    pub fn from_samples<S: AsRef<[i64]>>(samples: &[S]) -> Self {
        let total = samples.iter().map(|s| s.as_ref().len()).sum();
        let mut indices = Vec::with_capacity(total);
        let mut offsets = Vec::with_capacity(samples.len());
        for s in samples {
            offsets.push(indices.len() as i64);
            indices.extend_from_slice(s.as_ref());
        }
        Self { indices, offsets }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The index slice of sample `i`, or `None` if the offsets are malformed.
    pub fn sample(&self, i: usize) -> Option<&[i64]> {
        let start = usize::try_from(*self.offsets.get(i)?).ok()?;
        let end = match self.offsets.get(i + 1) {
            Some(&e) => usize::try_from(e).ok()?,
            None => self.indices.len(),
        };
        if start > end || end > self.indices.len() {
            return None;
        }
        Some(&self.indices[start..end])
    }
}

/// Server verdict for one sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationResult {
    /// Value in [-1, 1] from the POV of the encoded player.
    pub value: f32,
    /// Action logits for the encoded player.
    pub policy_player: Option<Vec<f32>>,
    /// Action logits for the encoded player's opponent.
    pub policy_opponent: Option<Vec<f32>>,
    /// Target-choice logits.
    pub policy_target: Option<Vec<f32>>,
    /// `[no, yes]` logits for optional effects.
    pub policy_binary: Option<Vec<f32>>,
}

impl EvaluationResult {
    pub fn value_only(value: f32) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_offsets_mark_segment_starts() {
        let samples: Vec<Vec<i64>> = vec![
            vec![1, 2, 3],
            vec![4],
            vec![5, 6, 7, 8],
            vec![9],
            vec![10, 11, 12, 13, 14],
        ];
        let req = BatchRequest::from_samples(&samples);
        assert_eq!(req.indices.len(), 14);
        assert_eq!(req.offsets, vec![0, 3, 4, 8, 9]);
        for (i, s) in samples.iter().enumerate() {
            assert_eq!(req.sample(i).unwrap(), s.as_slice());
        }
        assert!(req.sample(5).is_none());
    }

    #[test]
    fn empty_samples_are_representable() {
        let samples: Vec<Vec<i64>> = vec![vec![], vec![7], vec![]];
        let req = BatchRequest::from_samples(&samples);
        assert_eq!(req.offsets, vec![0, 0, 1]);
        assert_eq!(req.sample(0).unwrap(), &[] as &[i64]);
        assert_eq!(req.sample(1).unwrap(), &[7i64]);
        assert_eq!(req.sample(2).unwrap(), &[] as &[i64]);
    }
}
