//! End-to-end sampling tests on small conjugate models, where the posterior
//! is known in closed form.

use approx::assert_abs_diff_eq;
use graph_mcmc::diagnostics::{effective_sample_size, geweke, potential_scale_reduction};
use ndarray::{stack, Axis};
use ndarray_stats::CorrelationExt;
use graph_mcmc::distributions::{NormalDist, Param, PoissonDist};
use graph_mcmc::model::ModelBuilder;
use graph_mcmc::sampler::{sample_chains, Mcmc, SampleOptions};
use graph_mcmc::steppers::{AdaptiveMetropolis, Metropolis, Stepper};
use graph_mcmc::trace::TraceStorage;

const SEED: u64 = 42;

/// A single one-dimensional normal stochastic: the posterior is the prior.
#[test]
fn single_normal_stochastic_recovers_mean() {
    let model = ModelBuilder::new()
        .stochastic("x", NormalDist::new(Param::Const(3.0), Param::Const(1.0)), 3.0, &[])
        .build()
        .unwrap();
    let x_id = model.node_id("x").unwrap();
    let step = Metropolis::new(&model, x_id).proposal_sd(1.0);
    let mut mcmc = Mcmc::new(model)
        .set_seed(SEED)
        .use_step(Stepper::Metropolis(step));
    mcmc.sample(SampleOptions::new(10_000).burn(5_000).thin(1))
        .unwrap();

    let trace = mcmc.trace().as_f64("x").unwrap();
    assert_eq!(trace.len(), 5_000);
    mcmc.trace().check_equal_lengths(5_000).unwrap();

    let mean = trace.mean().unwrap();
    assert_abs_diff_eq!(mean, 3.0, epsilon = 0.15);

    let ess = effective_sample_size(trace.as_slice().unwrap()).unwrap();
    assert!(ess > 200.0, "chain mixes too slowly: ESS = {ess}");
}

/// Normal prior, one normal observation: posterior mean and variance are
/// conjugate-exact.
#[test]
fn conjugate_normal_posterior() {
    let (prior_sd, obs, obs_sd) = (2.0f64, 2.0f64, 1.0f64);
    let model = ModelBuilder::new()
        .stochastic(
            "mu",
            NormalDist::new(Param::Const(0.0), Param::Const(prior_sd)),
            0.0,
            &[],
        )
        .observed(
            "y",
            NormalDist::new(Param::Parent(0), Param::Const(obs_sd)),
            obs,
            &["mu"],
        )
        .build()
        .unwrap();
    let mut mcmc = Mcmc::new(model).set_seed(SEED);
    mcmc.sample(SampleOptions::new(10_000).burn(5_000)).unwrap();

    let trace = mcmc.trace().as_f64("mu").unwrap();
    assert_eq!(trace.len(), 5_000);

    let prior_var = prior_sd * prior_sd;
    let post_var = 1.0 / (1.0 / prior_var + 1.0 / (obs_sd * obs_sd));
    let post_mean = post_var * obs / (obs_sd * obs_sd);
    assert_abs_diff_eq!(trace.mean().unwrap(), post_mean, epsilon = 0.2);

    let emp_var = {
        let m = trace.mean().unwrap();
        trace.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (trace.len() as f64 - 1.0)
    };
    assert_abs_diff_eq!(emp_var, post_var, epsilon = 0.25);

    // A stationary chain passes the Geweke check comfortably.
    let scores = geweke(trace.as_slice().unwrap(), 0.1, 0.5, 20).unwrap();
    let outside = scores.iter().filter(|(_, z)| z.abs() > 2.0).count();
    assert!(
        outside as f64 / scores.len() as f64 <= 0.2,
        "too many Geweke scores outside ±2: {scores:?}"
    );
}

/// Poisson mean recovered through the automatically assigned discrete
/// stepper.
#[test]
fn discrete_poisson_mean() {
    let model = ModelBuilder::new()
        .stochastic("k", PoissonDist::new(Param::Const(4.0)), 4i64, &[])
        .build()
        .unwrap();
    let mut mcmc = Mcmc::new(model).set_seed(SEED);
    mcmc.sample(SampleOptions::new(20_000).burn(5_000)).unwrap();

    let trace = mcmc.trace().as_f64("k").unwrap();
    assert_eq!(trace.len(), 15_000);
    assert_abs_diff_eq!(trace.mean().unwrap(), 4.0, epsilon = 0.4);
    assert!(trace.iter().all(|&k| k >= 0.0 && k.fract() == 0.0));
}

/// A correlated pair updated jointly by AdaptiveMetropolis.
#[test]
fn adaptive_metropolis_joint_update() {
    let model = ModelBuilder::new()
        .stochastic("a", NormalDist::new(Param::Const(0.0), Param::Const(1.0)), 0.0, &[])
        .stochastic(
            "b",
            NormalDist::new(Param::Parent(0), Param::Const(0.5)),
            0.0,
            &["a"],
        )
        .build()
        .unwrap();
    let ids = vec![model.node_id("a").unwrap(), model.node_id("b").unwrap()];
    let am = AdaptiveMetropolis::new(&model, ids, None)
        .unwrap()
        .greedy(false)
        .delay(1_000)
        .interval(200);
    let mut mcmc = Mcmc::new(model)
        .set_seed(SEED)
        .use_step(Stepper::AdaptiveMetropolis(am));
    mcmc.sample(SampleOptions::new(30_000).burn(10_000)).unwrap();

    let a = mcmc.trace().as_f64("a").unwrap();
    let b = mcmc.trace().as_f64("b").unwrap();
    assert_eq!(a.len(), 20_000);
    assert_abs_diff_eq!(a.mean().unwrap(), 0.0, epsilon = 0.25);
    assert_abs_diff_eq!(b.mean().unwrap(), 0.0, epsilon = 0.3);

    // b = a + noise, so the chain must reproduce the strong correlation
    // corr(a, b) = 1/sqrt(1.25).
    let samples = stack(Axis(0), &[a.view(), b.view()]).unwrap();
    let cov = samples.cov(1.0).unwrap();
    let corr = cov[(0, 1)] / (cov[(0, 0)] * cov[(1, 1)]).sqrt();
    assert!(
        (0.7..=0.98).contains(&corr),
        "expected corr near {:.3}, got {corr:.3}",
        1.0 / 1.25f64.sqrt()
    );
}

/// Independent parallel chains agree on the posterior and never share state.
#[test]
fn parallel_chains_agree() {
    let build = || {
        ModelBuilder::new()
            .stochastic("mu", NormalDist::new(Param::Const(0.0), Param::Const(2.0)), 0.0, &[])
            .observed(
                "y",
                NormalDist::new(Param::Parent(0), Param::Const(1.0)),
                2.0,
                &["mu"],
            )
            .build()
            .unwrap()
    };
    let opts = SampleOptions::new(8_000).burn(3_000);
    let traces = sample_chains(|_| Mcmc::new(build()), 4, &opts, SEED).unwrap();
    assert_eq!(traces.len(), 4);

    // Posterior mean for this model is 1.6.
    for trace in &traces {
        assert_eq!(TraceStorage::len(trace), 5_000);
        let mu = trace.as_f64("mu").unwrap();
        assert_abs_diff_eq!(mu.mean().unwrap(), 1.6, epsilon = 0.3);
    }

    // Cross-chain comparison happens only after every chain finished.
    let series: Vec<_> = traces.iter().map(|t| t.as_f64("mu").unwrap()).collect();
    let views: Vec<_> = series.iter().map(|s| s.view()).collect();
    let chains = stack(Axis(0), &views).unwrap();
    let rhat = potential_scale_reduction(&chains).unwrap();
    assert!(rhat < 1.1, "independent chains should mix: R-hat = {rhat}");
}
