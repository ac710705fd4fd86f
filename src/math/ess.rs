//! Autocorrelation and effective sample size for MCMC output.
//!
//! `effective_sample_size` follows the multi-chain estimator with Geyer's
//! initial monotone positive sequence: within-chain autocovariances are
//! combined with the between-chain variance, and the autocorrelation sum is
//! truncated at the first negative pair of consecutive lags.

/// Lag-`k` autocovariance of one chain (biased, divided by `n`).
fn autocovariance(chain: &[f64], mean: f64, lag: usize) -> f64 {
    let n = chain.len();
    if lag >= n {
        return 0.0;
    }
    (0..n - lag)
        .map(|i| (chain[i] - mean) * (chain[i + lag] - mean))
        .sum::<f64>()
        / n as f64
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Lag-`k` autocorrelation of a single chain.
pub fn autocorrelation(chain: &[f64], lag: usize) -> f64 {
    if chain.len() < 2 {
        return 0.0;
    }
    let m = mean(chain);
    let var = autocovariance(chain, m, 0);
    if var <= 1e-300 {
        return 0.0;
    }
    autocovariance(chain, m, lag) / var
}

/// Effective sample size of a set of equal-length chains.
///
/// Degenerate input (constant draws) reports the nominal size `m·n`.
pub fn effective_sample_size(chains: &[Vec<f64>]) -> f64 {
    let m = chains.len();
    if m == 0 {
        return 0.0;
    }
    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0);
    if n < 4 {
        return (m * n) as f64;
    }
    let chains: Vec<&[f64]> = chains.iter().map(|c| &c[..n]).collect();
    let means: Vec<f64> = chains.iter().map(|c| mean(c)).collect();
    let n_f = n as f64;

    let acov_at = |lag: usize| -> f64 {
        chains
            .iter()
            .zip(&means)
            .map(|(c, &mu)| autocovariance(c, mu, lag))
            .sum::<f64>()
            / m as f64
    };

    let acov0 = acov_at(0);
    let mean_var = acov0 * n_f / (n_f - 1.0);
    let mut var_plus = mean_var * (n_f - 1.0) / n_f;
    if m > 1 {
        let grand = mean(&means);
        var_plus += means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>() / (m as f64 - 1.0);
    }
    if !(var_plus.is_finite() && var_plus > 1e-300) {
        return (m * n) as f64;
    }

    let rho = |lag: usize| 1.0 - (mean_var - acov_at(lag)) / var_plus;

    let mut rho_hat = vec![0.0; n];
    rho_hat[0] = 1.0;
    let mut rho_even = 1.0;
    let mut rho_odd = rho(1);
    rho_hat[1] = rho_odd;

    let mut t = 1usize;
    while t < n - 4 && rho_even + rho_odd > 0.0 {
        rho_even = rho(t + 1);
        rho_odd = rho(t + 2);
        if rho_even + rho_odd >= 0.0 {
            rho_hat[t + 1] = rho_even;
            rho_hat[t + 2] = rho_odd;
        }
        t += 2;
    }
    let max_t = t;
    if rho_even > 0.0 {
        rho_hat[max_t + 1] = rho_even;
    }

    // Initial monotone sequence.
    let mut t = 1usize;
    while t + 2 <= max_t {
        let prev = rho_hat[t - 1] + rho_hat[t];
        if rho_hat[t + 1] + rho_hat[t + 2] > prev {
            rho_hat[t + 1] = prev / 2.0;
            rho_hat[t + 2] = prev / 2.0;
        }
        t += 2;
    }

    let total = (m * n) as f64;
    let tau_hat = -1.0 + 2.0 * rho_hat[..=max_t].iter().sum::<f64>() + rho_hat[max_t + 1];
    let tau_hat = tau_hat.max(1.0 / total.log10());
    total / tau_hat
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn white_noise(seed: u64, n: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n).map(|_| normal.sample(&mut rng)).collect()
    }

    fn ar1(seed: u64, n: usize, phi: f64) -> Vec<f64> {
        let noise = white_noise(seed, n);
        let mut out = Vec::with_capacity(n);
        let mut prev = 0.0;
        for e in noise {
            prev = phi * prev + e;
            out.push(prev);
        }
        out
    }

    #[test]
    fn independent_draws_have_near_nominal_ess() {
        let chains = vec![white_noise(1, 1000), white_noise(2, 1000)];
        let ess = effective_sample_size(&chains);
        assert!(ess > 1400.0 && ess < 2600.0, "ess={ess}");
    }

    #[test]
    fn autocorrelated_draws_have_reduced_ess() {
        let chains = vec![ar1(3, 1000, 0.9), ar1(4, 1000, 0.9)];
        let ess = effective_sample_size(&chains);
        // Theoretical ratio (1-phi)/(1+phi) ≈ 0.053 → about 105 of 2000.
        assert!(ess < 400.0, "ess={ess}");
        assert!(ess > 20.0, "ess={ess}");
    }

    #[test]
    fn constant_chains_report_nominal_size() {
        let chains = vec![vec![1.0; 50], vec![1.0; 50]];
        assert_eq!(effective_sample_size(&chains), 100.0);
    }

    #[test]
    fn lag_one_autocorrelation_of_ar1() {
        let chain = ar1(5, 5000, 0.7);
        let rho = autocorrelation(&chain, 1);
        assert!((rho - 0.7).abs() < 0.05, "rho={rho}");
    }
}
