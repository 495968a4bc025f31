/*!
# Convergence diagnostics

Pure functions over completed traces: no coupling to a live sampler, array
in, numbers out.

- [`geweke`]: z-scores comparing early windows of a chain against its tail.
- [`raftery_lewis`]: run-length estimation for a quantile of interest.
- [`autocorrelation`]: normalized autocovariances, FFT-based.
- [`effective_sample_size`]: autocorrelation-time-adjusted sample count.
- [`discrepancy`]: Freeman-Tukey goodness-of-fit with a Bayesian p-value.

The Raftery-Lewis Markov-order test and the inverse normal CDF it needs are
implemented in-crate; the numeric choices are documented in DESIGN.md.
*/

use ndarray::{Array1, Array2};
use num_traits::{Float, ToPrimitive};
use rustfft::{num_complex::Complex, FftPlanner};
use std::cmp::Ordering;

use crate::error::DiagnosticsError;

/// Comparison for sorting f64 slices, NaN sorted last.
fn cmp_f64(a: &f64, b: &f64) -> Ordering {
    if a.is_nan() {
        return Ordering::Greater;
    }
    if b.is_nan() {
        return Ordering::Less;
    }
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

fn mean_var(xs: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

fn to_f64_vec<T: Float + ToPrimitive>(trace: &[T]) -> Vec<f64> {
    trace
        .iter()
        .map(|x| x.to_f64().expect("float converts to f64"))
        .collect()
}

/// Inverse standard normal CDF, Acklam's rational approximation.
/// Relative error below 1.15e-9 over the open unit interval.
pub fn norm_ppf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    if p == 0.0 {
        return f64::NEG_INFINITY;
    }
    if p == 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/**
Geweke convergence z-scores.

Probes `intervals` starting offsets evenly spaced over the first `first`
fraction of the trace; for each offset the window
`trace[offset..offset + first*len]` is compared against the trailing `last`
fraction of the full trace:

`z = (mean(early) - mean(late)) / sqrt(var(early) + var(late))`

Returns `(offset, z)` pairs. For a converged chain the scores concentrate
well inside ±2.
*/
pub fn geweke<T: Float + ToPrimitive>(
    trace: &[T],
    first: f64,
    last: f64,
    intervals: usize,
) -> Result<Vec<(usize, f64)>, DiagnosticsError> {
    if !(first > 0.0 && last > 0.0 && first + last <= 1.0) {
        return Err(DiagnosticsError::InvalidParameter {
            name: "first/last",
            reason: format!("first={first}, last={last}: both must be positive, summing to at most 1"),
        });
    }
    if intervals == 0 {
        return Err(DiagnosticsError::InvalidParameter {
            name: "intervals",
            reason: "must be at least 1".into(),
        });
    }
    let n = trace.len();
    let window = (first * n as f64).floor() as usize;
    let late_len = (last * n as f64).floor() as usize;
    if window < 2 || late_len < 2 {
        let needed = (2.0 / first.min(last)).ceil() as usize;
        return Err(DiagnosticsError::InsufficientSamples { needed, got: n });
    }

    let x = to_f64_vec(trace);
    let late_start = n - late_len;
    let (late_mean, late_var) = mean_var(&x[late_start..]);

    let max_offset = window;
    let mut scores = Vec::with_capacity(intervals);
    for i in 0..intervals {
        let offset = if intervals == 1 {
            0
        } else {
            i * max_offset / (intervals - 1)
        };
        // The early window must not reach into the late segment.
        if offset + window > late_start {
            continue;
        }
        let (early_mean, early_var) = mean_var(&x[offset..offset + window]);
        let z = (early_mean - late_mean) / (early_var + late_var).sqrt();
        scores.push((offset, z));
    }
    scores.dedup_by_key(|(offset, _)| *offset);
    if scores.is_empty() {
        return Err(DiagnosticsError::InsufficientSamples {
            needed: 2 * window + late_len,
            got: n,
        });
    }
    Ok(scores)
}

/// Result of [`raftery_lewis`].
#[derive(Debug, Clone, PartialEq)]
pub struct RafteryLewis {
    /// Thinning interval at which the indicator chain is first-order Markov.
    pub thin: usize,
    /// Required burn-in, in raw iterations.
    pub burn_in: usize,
    /// Required post-burn-in iterations, dependence-adjusted.
    pub total: usize,
    /// Iterations that would suffice for independent draws.
    pub n_min: usize,
    /// `(burn_in + total) / n_min`; values well above 1 flag strong
    /// autocorrelation.
    pub dependence_factor: f64,
}

/// Likelihood-ratio (G²) test of second- versus first-order Markov
/// dependence over the indicator triples, compared on BIC. Negative BIC
/// means first-order wins.
fn first_order_preferred(z: &[u8]) -> bool {
    let m = z.len();
    if m < 3 {
        return false;
    }
    let mut triples = [[[0.0f64; 2]; 2]; 2];
    for w in z.windows(3) {
        triples[w[0] as usize][w[1] as usize][w[2] as usize] += 1.0;
    }
    let mut g2 = 0.0;
    for i in 0..2 {
        for j in 0..2 {
            for k in 0..2 {
                let n_ijk = triples[i][j][k];
                if n_ijk == 0.0 {
                    continue;
                }
                let n_ij: f64 = triples[i][j].iter().sum();
                let n_jk: f64 = (0..2).map(|a| triples[a][j][k]).sum();
                let n_j: f64 = (0..2).map(|a| triples[a][j].iter().sum::<f64>()).sum();
                g2 += 2.0 * n_ijk * (n_ijk * n_j / (n_ij * n_jk)).ln();
            }
        }
    }
    let bic = g2 - 2.0 * ((m - 2) as f64).ln();
    bic <= 0.0
}

/**
Raftery-Lewis run-length estimation.

Estimates how many iterations are needed to report the quantile `q` to
within `±r` with probability `s`. The trace is reduced to the indicator
`Z[t] = trace[t] <= quantile(trace, q)`; the smallest thinning `k` for which
the thinned indicator behaves first-order Markov is found, the two-state
transition probabilities are estimated from the thinned chain, and burn-in /
run-length follow from the spectral gap of that chain; `epsilon` is the
tolerated distance from the limiting distribution at the end of burn-in.
*/
pub fn raftery_lewis(
    trace: &[f64],
    q: f64,
    r: f64,
    s: f64,
    epsilon: f64,
) -> Result<RafteryLewis, DiagnosticsError> {
    for (name, value, lo, hi) in [
        ("q", q, 0.0, 1.0),
        ("r", r, 0.0, 0.5),
        ("s", s, 0.0, 1.0),
    ] {
        if !(value > lo && value < hi) {
            return Err(DiagnosticsError::InvalidParameter {
                name,
                reason: format!("{value} outside ({lo}, {hi})"),
            });
        }
    }
    if !(epsilon > 0.0) {
        return Err(DiagnosticsError::InvalidParameter {
            name: "epsilon",
            reason: "must be positive".into(),
        });
    }

    let n = trace.len();
    let phi = norm_ppf(0.5 * (s + 1.0));
    let n_min = (q * (1.0 - q) * (phi / r).powi(2)).ceil() as usize;
    if n < n_min {
        return Err(DiagnosticsError::InsufficientSamples {
            needed: n_min,
            got: n,
        });
    }

    let mut sorted = trace.to_vec();
    sorted.sort_unstable_by(cmp_f64);
    let cutoff = sorted[((n - 1) as f64 * q).floor() as usize];
    let z: Vec<u8> = trace.iter().map(|&x| (x <= cutoff) as u8).collect();

    // Bounded search for the thinning interval.
    let k_max = (n / 50).max(1);
    let mut chosen = None;
    for k in 1..=k_max {
        let thinned: Vec<u8> = z.iter().step_by(k).copied().collect();
        if thinned.len() < 50 {
            break;
        }
        if first_order_preferred(&thinned) {
            chosen = Some((k, thinned));
            break;
        }
    }
    let (k, thinned) = chosen.ok_or_else(|| {
        DiagnosticsError::NonConvergentEstimate(format!(
            "no thinning interval up to {k_max} makes the indicator chain first-order Markov"
        ))
    })?;

    let mut counts = [[0u64; 2]; 2];
    for w in thinned.windows(2) {
        counts[w[0] as usize][w[1] as usize] += 1;
    }
    let from0 = counts[0][0] + counts[0][1];
    let from1 = counts[1][0] + counts[1][1];
    if from0 == 0 || from1 == 0 || counts[0][1] == 0 || counts[1][0] == 0 {
        return Err(DiagnosticsError::NonConvergentEstimate(
            "indicator chain is degenerate: a state is never visited or never left".into(),
        ));
    }
    let alpha = counts[0][1] as f64 / from0 as f64;
    let beta = counts[1][0] as f64 / from1 as f64;
    let lambda = 1.0 - alpha - beta;
    if lambda.abs() >= 1.0 {
        return Err(DiagnosticsError::NonConvergentEstimate(
            "two-state chain has no spectral gap".into(),
        ));
    }

    // Smallest m with |lambda|^m * max(alpha,beta)/(alpha+beta) <= epsilon:
    // the distance from the limiting two-state distribution after m thinned
    // steps from the worst starting state.
    let coef = alpha.max(beta) / (alpha + beta);
    let mut m = 1u64;
    let mut dist = coef * lambda.abs();
    while dist > epsilon {
        m += 1;
        dist *= lambda.abs();
        if m > 1_000_000 {
            return Err(DiagnosticsError::NonConvergentEstimate(
                "burn-in estimate did not converge".into(),
            ));
        }
    }
    let burn_in = m as usize * k;

    let n_star =
        (2.0 - alpha - beta) * alpha * beta / (alpha + beta).powi(3) * (phi / r).powi(2);
    let total = n_star.ceil() as usize * k;

    Ok(RafteryLewis {
        thin: k,
        burn_in,
        total,
        n_min,
        dependence_factor: (burn_in + total) as f64 / n_min as f64,
    })
}

/**
Normalized autocovariance sequence for lags `0..=maxlag`.

Computed through the FFT of the mean-centered, zero-padded trace;
`rho[0]` is 1 by construction.
*/
pub fn autocorrelation<T: Float + ToPrimitive>(
    trace: &[T],
    maxlag: usize,
) -> Result<Vec<f64>, DiagnosticsError> {
    let n = trace.len();
    if n < 2 || maxlag >= n {
        return Err(DiagnosticsError::InsufficientSamples {
            needed: (maxlag + 1).max(2),
            got: n,
        });
    }
    let x = to_f64_vec(trace);
    let mean = x.iter().sum::<f64>() / n as f64;

    let size = (2 * n).next_power_of_two();
    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(size).process(&mut buf);
    for c in buf.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(size).process(&mut buf);

    let c0 = buf[0].re;
    if !(c0 > 0.0) {
        return Err(DiagnosticsError::NonConvergentEstimate(
            "trace has zero variance".into(),
        ));
    }
    let mut rho: Vec<f64> = (0..=maxlag).map(|k| buf[k].re / c0).collect();
    rho[0] = 1.0;
    Ok(rho)
}

/// Effective sample size from the autocorrelation time, using Geyer's
/// initial positive sequence to truncate the lag sum.
pub fn effective_sample_size(trace: &[f64]) -> Result<f64, DiagnosticsError> {
    let n = trace.len();
    if n < 4 {
        return Err(DiagnosticsError::InsufficientSamples { needed: 4, got: n });
    }
    let rho = autocorrelation(trace, n - 1)?;
    let mut tau = -1.0;
    let mut m = 0;
    while 2 * m + 1 < rho.len() {
        let pair = rho[2 * m] + rho[2 * m + 1];
        if pair <= 0.0 {
            break;
        }
        tau += 2.0 * pair;
        m += 1;
    }
    Ok(n as f64 / tau.max(1.0))
}

/// Gelman-Rubin potential scale reduction over parallel chains.
///
/// `chains` holds one row per chain, one column per draw; every chain must
/// have reached `Finished` before its trace is compared here. Values close
/// to 1 indicate the chains agree; above ~1.1 they have not yet mixed.
pub fn potential_scale_reduction(chains: &Array2<f64>) -> Result<f64, DiagnosticsError> {
    let (m, n) = chains.dim();
    if m < 2 || n < 2 {
        return Err(DiagnosticsError::InsufficientSamples {
            needed: 2,
            got: m.min(n),
        });
    }
    let nf = n as f64;
    let chain_means: Vec<f64> = chains
        .rows()
        .into_iter()
        .map(|row| row.mean().expect("non-empty row"))
        .collect();
    let grand_mean = chain_means.iter().sum::<f64>() / m as f64;
    let between = nf / (m as f64 - 1.0)
        * chain_means
            .iter()
            .map(|&mu| (mu - grand_mean) * (mu - grand_mean))
            .sum::<f64>();
    let within = chains
        .rows()
        .into_iter()
        .zip(&chain_means)
        .map(|(row, &mu)| row.iter().map(|&x| (x - mu) * (x - mu)).sum::<f64>() / (nf - 1.0))
        .sum::<f64>()
        / m as f64;
    if !(within > 0.0) {
        return Err(DiagnosticsError::NonConvergentEstimate(
            "within-chain variance is zero".into(),
        ));
    }
    let var = (nf - 1.0) / nf * within + between / nf;
    Ok((var / within).sqrt())
}

/// Result of [`discrepancy`]: one Freeman-Tukey statistic per posterior
/// draw, for the observed data and for the replicated data.
#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub observed: Array1<f64>,
    pub simulated: Array1<f64>,
}

impl Discrepancy {
    /// Fraction of draws where the replicated discrepancy exceeds the
    /// observed one. Values near 0 or 1 indicate model misfit.
    pub fn bayesian_p_value(&self) -> f64 {
        let exceed = self
            .observed
            .iter()
            .zip(self.simulated.iter())
            .filter(|(obs, sim)| sim > obs)
            .count();
        exceed as f64 / self.observed.len() as f64
    }
}

/**
Freeman-Tukey discrepancy for goodness-of-fit checks.

`observed` holds the data (one entry per observation point), `simulated`
holds replicated data and `expected` the expected values, both with one row
per posterior draw. Per draw `i`:

`D_obs[i] = sum_j (sqrt(observed[j]) - sqrt(expected[i][j]))^2`
`D_sim[i] = sum_j (sqrt(simulated[i][j]) - sqrt(expected[i][j]))^2`
*/
pub fn discrepancy(
    observed: &Array1<f64>,
    simulated: &Array2<f64>,
    expected: &Array2<f64>,
) -> Result<Discrepancy, DiagnosticsError> {
    if simulated.dim() != expected.dim() {
        return Err(DiagnosticsError::InvalidParameter {
            name: "simulated/expected",
            reason: format!(
                "shape mismatch: {:?} vs {:?}",
                simulated.dim(),
                expected.dim()
            ),
        });
    }
    let (draws, points) = simulated.dim();
    if observed.len() != points {
        return Err(DiagnosticsError::InvalidParameter {
            name: "observed",
            reason: format!("{} points, expected {}", observed.len(), points),
        });
    }
    if draws == 0 {
        return Err(DiagnosticsError::InsufficientSamples { needed: 1, got: 0 });
    }
    let negative = observed.iter().any(|&x| x < 0.0)
        || simulated.iter().any(|&x| x < 0.0)
        || expected.iter().any(|&x| x < 0.0);
    if negative {
        return Err(DiagnosticsError::InvalidParameter {
            name: "data",
            reason: "Freeman-Tukey requires non-negative values".into(),
        });
    }

    let mut d_obs = Array1::zeros(draws);
    let mut d_sim = Array1::zeros(draws);
    for i in 0..draws {
        let mut obs_acc = 0.0;
        let mut sim_acc = 0.0;
        for j in 0..points {
            let e = expected[(i, j)].sqrt();
            let o = observed[j].sqrt() - e;
            let s = simulated[(i, j)].sqrt() - e;
            obs_acc += o * o;
            sim_acc += s * s;
        }
        d_obs[i] = obs_acc;
        d_sim[i] = sim_acc;
    }
    Ok(Discrepancy {
        observed: d_obs,
        simulated: d_sim,
    })
}
