//! Log densities and parameter transforms used by the IPM.
//!
//! All densities return natural-log values and are written for repeated calls
//! inside the sampler, so they avoid allocation.

use statrs::function::gamma::ln_gamma;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// `ln Normal(x | mean, sd)`.
pub fn normal_lpdf(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - LN_SQRT_2PI
}

/// `ln HalfNormal(x | scale)` for `x > 0`.
pub fn half_normal_lpdf(x: f64, scale: f64) -> f64 {
    if x <= 0.0 {
        return f64::NEG_INFINITY;
    }
    normal_lpdf(x, 0.0, scale) + std::f64::consts::LN_2
}

/// `ln Dirichlet(p | alpha)` given `ln p`.
///
/// `norm` is the precomputed `lnΓ(Σα) - Σ lnΓ(α_k)`.
pub fn dirichlet_lpdf_with_norm(ln_p: &[f64], alpha: &[f64], norm: f64) -> f64 {
    norm + ln_p
        .iter()
        .zip(alpha)
        .map(|(lp, a)| (a - 1.0) * lp)
        .sum::<f64>()
}

/// Normalizing constant `lnΓ(Σα) - Σ lnΓ(α_k)` of a Dirichlet.
pub fn dirichlet_norm(alpha: &[f64]) -> f64 {
    let total: f64 = alpha.iter().sum();
    ln_gamma(total) - alpha.iter().map(|&a| ln_gamma(a)).sum::<f64>()
}

/// Data-only part of the multinomial log pmf: `lnΓ(Y+1) - Σ lnΓ(O_k+1)`.
pub fn multinomial_coefficient(counts: &[f64]) -> f64 {
    let total: f64 = counts.iter().sum();
    ln_gamma(total + 1.0) - counts.iter().map(|&c| ln_gamma(c + 1.0)).sum::<f64>()
}

/// Numerically stable `ln Σ exp(x_i)`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Inverse additive log-ratio: `K-1` unconstrained values → `ln p` on the `K`-simplex.
///
/// The last component is the reference category. Returns the log-Jacobian
/// `Σ ln p_k` of the transform.
pub fn alr_inverse_ln(u: &[f64], ln_p: &mut [f64]) -> f64 {
    debug_assert_eq!(u.len() + 1, ln_p.len());
    let mut terms = [0.0_f64; 16];
    let k = ln_p.len();
    let lse = if k <= terms.len() {
        terms[..u.len()].copy_from_slice(u);
        terms[u.len()] = 0.0;
        log_sum_exp(&terms[..k])
    } else {
        let mut owned = u.to_vec();
        owned.push(0.0);
        log_sum_exp(&owned)
    };
    for (dst, &src) in ln_p.iter_mut().zip(u) {
        *dst = src - lse;
    }
    ln_p[k - 1] = -lse;
    ln_p.iter().sum()
}

/// Forward additive log-ratio of a simplex point (last component as reference).
pub fn alr_forward(p: &[f64]) -> Vec<f64> {
    let last = p[p.len() - 1].max(1e-12).ln();
    p[..p.len() - 1]
        .iter()
        .map(|&v| v.max(1e-12).ln() - last)
        .collect()
}

pub fn logistic(u: f64) -> f64 {
    if u >= 0.0 {
        1.0 / (1.0 + (-u).exp())
    } else {
        let e = u.exp();
        e / (1.0 + e)
    }
}

pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}
