//! Prior and move-distribution helpers over variable-length child lists.

use rand::Rng;
use rand_distr::{Distribution, Gamma};

/// Temperature-scaled softmax over `logits`. Non-finite logits get zero mass;
/// if nothing usable remains the result is uniform.
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    let t = if temperature.is_finite() && temperature > 0.0 {
        temperature
    } else {
        1.0
    };
    let max = logits
        .iter()
        .copied()
        .filter(|x| x.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return uniform(logits.len());
    }

    let mut out = vec![0.0f32; logits.len()];
    let mut sum = 0.0f32;
    for (o, &l) in out.iter_mut().zip(logits) {
        if l.is_finite() {
            let z = ((l - max) / t).exp();
            if z.is_finite() {
                *o = z;
                sum += z;
            }
        }
    }
    if !(sum.is_finite() && sum > 0.0) {
        return uniform(logits.len());
    }
    for v in &mut out {
        *v /= sum;
    }
    out
}

pub fn uniform(n: usize) -> Vec<f32> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f32; n]
}

/// Mix Dirichlet(alpha) noise into `priors`: `(1-eps)·p + eps·eta`.
///
/// Invalid parameters leave the priors untouched.
pub fn mix_dirichlet_noise(priors: &mut [f32], alpha: f32, eps: f32, rng: &mut impl Rng) {
    if priors.len() < 2
        || !(alpha.is_finite() && alpha > 0.0 && eps.is_finite() && (0.0..=1.0).contains(&eps))
    {
        return;
    }
    // Sample gamma(alpha, 1) per child, then normalize -> Dirichlet.
    let gamma = match Gamma::new(alpha as f64, 1.0) {
        Ok(g) => g,
        Err(_) => return,
    };
    let eta: Vec<f64> = (0..priors.len()).map(|_| gamma.sample(rng)).collect();
    let sum: f64 = eta.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
        return;
    }
    for (p, &e) in priors.iter_mut().zip(&eta) {
        *p = (1.0 - eps) * *p + eps * (e / sum) as f32;
    }
}

/// Distribution proportional to `visits^(1/t)`.
///
/// `t <= 0` (or non-finite) is greedy: all mass on the most visited entry,
/// lowest index on ties.
pub fn visit_distribution(visits: &[u32], t: f32) -> Vec<f32> {
    let mut out = vec![0.0f32; visits.len()];
    if visits.is_empty() {
        return out;
    }
    if !(t.is_finite() && t > 0.0) {
        out[argmax_first(visits)] = 1.0;
        return out;
    }
    let inv_t = 1.0 / t as f64;
    let mut sum = 0.0f64;
    let weights: Vec<f64> = visits
        .iter()
        .map(|&n| {
            let w = (n as f64).powf(inv_t);
            sum += w;
            w
        })
        .collect();
    if !(sum.is_finite() && sum > 0.0) {
        return uniform(visits.len());
    }
    for (o, w) in out.iter_mut().zip(weights) {
        *o = (w / sum) as f32;
    }
    out
}

/// Sample an index from a distribution. Falls back to the last index with
/// positive mass when rounding leaves a remainder.
pub fn sample_index(dist: &[f32], rng: &mut impl Rng) -> usize {
    let total: f32 = dist.iter().sum();
    if dist.is_empty() || !(total.is_finite() && total > 0.0) {
        return 0;
    }
    let mut x = rng.gen::<f32>() * total;
    let mut last = 0;
    for (i, &p) in dist.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        last = i;
        if x < p {
            return i;
        }
        x -= p;
    }
    last
}

fn argmax_first(visits: &[u32]) -> usize {
    let mut best = 0;
    for (i, &n) in visits.iter().enumerate() {
        if n > visits[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn softmax_is_a_distribution_over_children_only() {
        let p = softmax(&[1.0, 2.0, 3.0], 1.0);
        assert_eq!(p.len(), 3);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn higher_temperature_flattens() {
        let sharp = softmax(&[0.0, 4.0], 0.5);
        let flat = softmax(&[0.0, 4.0], 4.0);
        assert!(sharp[1] > flat[1]);
    }

    #[test]
    fn degenerate_logits_fall_back_to_uniform() {
        assert_eq!(softmax(&[f32::NAN, f32::NEG_INFINITY], 1.0), vec![0.5, 0.5]);
    }

    #[test]
    fn dirichlet_noise_is_reproducible_and_normalized() {
        let mut a = vec![0.25f32; 4];
        let mut b = a.clone();
        mix_dirichlet_noise(&mut a, 0.3, 0.25, &mut ChaCha8Rng::seed_from_u64(11));
        mix_dirichlet_noise(&mut b, 0.3, 0.25, &mut ChaCha8Rng::seed_from_u64(11));
        assert_eq!(a, b);
        assert!((a.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_ne!(a, vec![0.25f32; 4]);
    }

    #[test]
    fn greedy_visit_distribution_breaks_ties_low() {
        assert_eq!(visit_distribution(&[3, 7, 7], 0.0), vec![0.0, 1.0, 0.0]);
        let d = visit_distribution(&[1, 3], 1.0);
        assert!((d[0] - 0.25).abs() < 1e-6);
    }
}
