/*!
# MCMC sampler

[`Mcmc`] owns a [`Model`], a set of [`Stepper`]s, and a [`MemoryTrace`], and
drives the Metropolis-within-Gibbs sweep: every iteration each stepper runs
once in a fixed order, tuning happens at checkpoints, and values are tallied
into the trace after burn-in, thinned.

The loop is cooperative: [`Mcmc::advance`] runs exactly one iteration and
returns the sampler state, so a caller can pause, resume, or halt between
iterations without losing state. [`Mcmc::sample`] drives `advance` to
completion with an optional progress bar.

Independent parallel chains share nothing; [`sample_chains`] builds one
sampler per chain from a factory closure, derives per-chain seeds from a
global seed, and runs them on a rayon pool.

# Examples

```rust
use graph_mcmc::distributions::{NormalDist, Param};
use graph_mcmc::model::ModelBuilder;
use graph_mcmc::sampler::{Mcmc, SampleOptions};

let model = ModelBuilder::new()
    .stochastic("mu", NormalDist::new(Param::Const(0.0), Param::Const(5.0)), 0.0, &[])
    .observed("y", NormalDist::new(Param::Parent(0), Param::Const(1.0)), 1.0, &["mu"])
    .build()
    .unwrap();

let mut mcmc = Mcmc::new(model).set_seed(42);
mcmc.sample(SampleOptions::new(200).burn(100)).unwrap();
assert_eq!(mcmc.trace().as_f64("mu").unwrap().len(), 100);
```
*/

use std::collections::BTreeMap;
use std::collections::HashSet;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{McmcError, StepError};
use crate::model::Model;
use crate::node::{NodeId, Value};
use crate::steppers::{assign_stepper, Stepper, TuningState};
use crate::trace::{MemoryTrace, TraceStorage};

/// The sampler's lifecycle state.
///
/// `Initialized → Sampling → {Paused ⇄ Sampling} → Finished`, with `Halted`
/// reachable from any active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Initialized,
    Sampling,
    Paused,
    Halted,
    Finished,
}

/// When tuning checkpoints fire.
///
/// Adapting proposal scales forever at a fixed cadence would break the
/// stationary distribution; both variants preserve the diminishing-adaptation
/// guarantee, one by freezing, one by slowing down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TuneSchedule {
    /// Tune only during burn-in; afterwards all adaptation freezes.
    DuringBurnIn,
    /// Keep tuning past burn-in, but grow the interval between checkpoints
    /// by `growth` (> 1) after every post-burn-in tune.
    Throughout { growth: f64 },
}

/// Configuration for one sampling run.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOptions {
    pub iter: u64,
    pub burn: u64,
    pub thin: u64,
    pub tune_interval: u64,
    pub tuning: TuneSchedule,
    pub save_interval: Option<u64>,
    pub progress: bool,
}

impl SampleOptions {
    pub fn new(iter: u64) -> Self {
        Self {
            iter,
            burn: 0,
            thin: 1,
            tune_interval: 100,
            tuning: TuneSchedule::DuringBurnIn,
            save_interval: None,
            progress: false,
        }
    }

    pub fn burn(mut self, burn: u64) -> Self {
        self.burn = burn;
        self
    }

    pub fn thin(mut self, thin: u64) -> Self {
        self.thin = thin.max(1);
        self
    }

    pub fn tune_interval(mut self, interval: u64) -> Self {
        self.tune_interval = interval.max(1);
        self
    }

    pub fn tuning(mut self, schedule: TuneSchedule) -> Self {
        self.tuning = schedule;
        self
    }

    pub fn save_interval(mut self, interval: u64) -> Self {
        self.save_interval = Some(interval.max(1));
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}

/// A deep snapshot of the chain: every node value plus every stepper's
/// tuning state, keyed by the save index it was taken at. Restoring one
/// resumes sampling from exactly that point.
#[derive(Debug, Clone)]
pub struct ChainState {
    pub iteration: u64,
    pub save_index: usize,
    pub values: BTreeMap<String, Value>,
    pub tuning: Vec<TuningState>,
}

/// A user-registered quantity tallied alongside variable values.
type TraceFn = Box<dyn Fn(&Model) -> Value + Send>;

/// The Markov chain Monte Carlo sampler.
pub struct Mcmc {
    model: Model,
    steppers: Vec<Stepper>,
    explicit: HashSet<NodeId>,
    trace: MemoryTrace,
    trace_fns: Vec<(String, TraceFn)>,
    snapshots: Vec<ChainState>,
    opts: SampleOptions,
    state: SamplerState,
    iteration: u64,
    tune_interval_current: u64,
    adaptation_frozen: bool,
    seed: u64,
    rng: SmallRng,
}

impl Mcmc {
    pub fn new(model: Model) -> Self {
        let seed = thread_rng().gen::<u64>();
        Self {
            model,
            steppers: Vec::new(),
            explicit: HashSet::new(),
            trace: MemoryTrace::new(),
            trace_fns: Vec::new(),
            snapshots: Vec::new(),
            opts: SampleOptions::new(0),
            state: SamplerState::Initialized,
            iteration: 0,
            tune_interval_current: 0,
            adaptation_frozen: false,
            seed,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Sets the random seed, for reproducible runs.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Assigns a step method explicitly. A node may carry several explicit
    /// steppers; they run every iteration in assignment order, each seeing
    /// the value the previous one left. Explicitly covered nodes are skipped
    /// by automatic assignment.
    pub fn use_step(mut self, stepper: Stepper) -> Self {
        self.explicit.extend(stepper.variables());
        self.steppers.push(stepper);
        self
    }

    /// Registers an extra quantity to tally each save, computed from the
    /// model's current state.
    pub fn register_trace_fn(
        mut self,
        name: &str,
        f: impl Fn(&Model) -> Value + Send + 'static,
    ) -> Self {
        self.trace_fns.push((name.to_string(), Box::new(f)));
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn trace(&self) -> &MemoryTrace {
        &self.trace
    }

    pub fn into_trace(self) -> MemoryTrace {
        self.trace
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Chain-state snapshots collected at `save_interval` boundaries.
    pub fn snapshots(&self) -> &[ChainState] {
        &self.snapshots
    }

    /// Prepares a run: fills in automatic step-method assignments for every
    /// free stochastic without an explicit stepper, resets the trace and
    /// iteration counter, and enters `Sampling`.
    pub fn begin(&mut self, opts: SampleOptions) -> Result<(), McmcError> {
        if matches!(self.state, SamplerState::Sampling | SamplerState::Paused) {
            return Err(McmcError::InvalidState(
                "begin called while a run is active".into(),
            ));
        }
        for node in self.model.free_stochastics().to_vec() {
            if !self.explicit.contains(&node) {
                let stepper = assign_stepper(&self.model, node)?;
                self.explicit.insert(node);
                self.steppers.push(stepper);
            }
        }
        self.tune_interval_current = opts.tune_interval.max(1);
        self.adaptation_frozen = false;
        self.iteration = 0;
        self.trace = MemoryTrace::new();
        self.snapshots.clear();
        self.opts = opts;
        self.state = if self.opts.iter == 0 {
            SamplerState::Finished
        } else {
            SamplerState::Sampling
        };
        log::info!(
            "sampling {} iterations (burn {}, thin {}) with {} step methods",
            self.opts.iter,
            self.opts.burn,
            self.opts.thin,
            self.steppers.len()
        );
        Ok(())
    }

    /// Runs exactly one iteration, or nothing if the sampler is paused. All
    /// control transitions happen at this boundary: a requested halt takes
    /// effect here, and a step error halts the chain with a consistent,
    /// truncated trace.
    pub fn advance(&mut self) -> Result<SamplerState, McmcError> {
        match self.state {
            SamplerState::Paused => return Ok(SamplerState::Paused),
            SamplerState::Sampling => {}
            _ => {
                return Err(McmcError::InvalidState(format!(
                    "advance called in {:?}",
                    self.state
                )))
            }
        }
        // One Metropolis-Hastings sweep, fixed stepper order.
        let mut step_err = None;
        for stepper in &mut self.steppers {
            if let Err(err) = stepper.step(&mut self.model, &mut self.rng) {
                step_err = Some(err);
                break;
            }
        }
        if let Some(err) = step_err {
            return Err(self.halt_with(err));
        }

        let completed = self.iteration + 1;

        // Tune checkpoint.
        if completed % self.tune_interval_current == 0 {
            match self.opts.tuning {
                TuneSchedule::DuringBurnIn => {
                    if completed <= self.opts.burn {
                        self.tune_all();
                    }
                }
                TuneSchedule::Throughout { growth } => {
                    self.tune_all();
                    if completed > self.opts.burn {
                        let grown = (self.tune_interval_current as f64 * growth.max(1.0)).ceil();
                        self.tune_interval_current = grown as u64;
                    }
                }
            }
        }
        // Freeze history-dependent adaptation once burn-in tuning ends.
        if !self.adaptation_frozen
            && self.opts.tuning == TuneSchedule::DuringBurnIn
            && completed >= self.opts.burn
        {
            self.adaptation_frozen = true;
            for stepper in &mut self.steppers {
                stepper.set_adapting(false);
            }
        }

        // Tally.
        if self.iteration >= self.opts.burn
            && (self.iteration - self.opts.burn) % self.opts.thin == 0
        {
            self.tally();
        }

        // Chain-state snapshot.
        if let Some(every) = self.opts.save_interval {
            if completed % every == 0 {
                self.snapshots.push(self.snapshot());
            }
        }

        self.iteration = completed;
        if self.iteration >= self.opts.iter {
            self.state = SamplerState::Finished;
            log::info!(
                "finished: {} samples per quantity",
                TraceStorage::len(&self.trace)
            );
        }
        Ok(self.state)
    }

    /// Drives the chain to completion. On a step error the chain halts with
    /// its trace truncated to the last complete tally, and the error is
    /// returned.
    pub fn sample(&mut self, opts: SampleOptions) -> Result<(), McmcError> {
        let progress = opts.progress;
        self.begin(opts)?;
        let bar = progress.then(|| {
            let pb = ProgressBar::new(self.opts.iter);
            pb.set_style(progress_style());
            pb
        });
        self.run_to_end(bar.as_ref())
    }

    fn run_to_end(&mut self, bar: Option<&ProgressBar>) -> Result<(), McmcError> {
        if self.state == SamplerState::Finished {
            return Ok(());
        }
        loop {
            match self.advance()? {
                SamplerState::Sampling => {
                    if let Some(pb) = bar {
                        pb.inc(1);
                    }
                }
                SamplerState::Finished => {
                    if let Some(pb) = bar {
                        pb.finish_with_message("done");
                    }
                    return Ok(());
                }
                SamplerState::Halted => return Ok(()),
                SamplerState::Paused | SamplerState::Initialized => {
                    return Err(McmcError::InvalidState(
                        "chain paused during a blocking run".into(),
                    ))
                }
            }
        }
    }

    /// Pauses at the next iteration boundary. Only meaningful while
    /// sampling.
    pub fn pause(&mut self) -> Result<(), McmcError> {
        match self.state {
            SamplerState::Sampling => {
                self.state = SamplerState::Paused;
                Ok(())
            }
            other => Err(McmcError::InvalidState(format!("pause in {other:?}"))),
        }
    }

    /// Resumes a paused chain; the next `advance` continues with the
    /// iteration after the last completed one, with no state loss.
    pub fn resume(&mut self) -> Result<(), McmcError> {
        match self.state {
            SamplerState::Paused => {
                self.state = SamplerState::Sampling;
                Ok(())
            }
            other => Err(McmcError::InvalidState(format!("resume in {other:?}"))),
        }
    }

    /// Requests a halt. Takes effect immediately between iterations; the
    /// trace is truncated to the last complete tally.
    pub fn halt(&mut self) {
        match self.state {
            SamplerState::Sampling | SamplerState::Paused => {
                self.do_halt();
            }
            _ => {}
        }
    }

    fn do_halt(&mut self) -> SamplerState {
        let complete = TraceStorage::len(&self.trace);
        self.trace.truncate(complete);
        self.state = SamplerState::Halted;
        log::warn!(
            "halted after {} iterations, {} samples kept",
            self.iteration,
            complete
        );
        SamplerState::Halted
    }

    fn halt_with(&mut self, err: StepError) -> McmcError {
        self.do_halt();
        McmcError::Step(err)
    }

    fn tune_all(&mut self) {
        for stepper in &mut self.steppers {
            stepper.tune(&self.model);
        }
    }

    /// Appends one tally: every free stochastic's value, every tunable
    /// stepper's scale factor, every user trace function, and the deviance.
    fn tally(&mut self) {
        for &node in self.model.free_stochastics() {
            self.trace
                .write(self.model.node(node).name(), self.model.node(node).value().clone());
        }
        for stepper in &self.steppers {
            if let Some(scale) = stepper.tuning_value(&self.model) {
                let name = format!("{}_adaptive_scale", stepper.label());
                self.trace.write(&name, Value::F64(scale));
            }
        }
        for (name, f) in &self.trace_fns {
            self.trace.write(name, f(&self.model));
        }
        self.trace.write("deviance", Value::F64(self.model.deviance()));
    }

    /// Deep snapshot of the current chain state.
    pub fn snapshot(&self) -> ChainState {
        ChainState {
            iteration: self.iteration,
            save_index: TraceStorage::len(&self.trace),
            values: self.model.value(),
            tuning: self.steppers.iter().map(Stepper::tuning_state).collect(),
        }
    }

    /// Restores a snapshot taken by [`Mcmc::snapshot`]: node values, stepper
    /// tuning state, and the iteration counter, with the trace truncated to
    /// the snapshot's save index. The chain lands in `Paused`; `resume` it
    /// to continue.
    pub fn restore(&mut self, state: &ChainState) -> Result<(), McmcError> {
        if self.state == SamplerState::Initialized {
            return Err(McmcError::InvalidState(
                "restore before the first begin".into(),
            ));
        }
        if state.tuning.len() != self.steppers.len() {
            return Err(McmcError::InvalidState(format!(
                "snapshot has {} tuning states, sampler has {} steppers",
                state.tuning.len(),
                self.steppers.len()
            )));
        }
        for (name, value) in &state.values {
            let id = self
                .model
                .node_id(name)
                .ok_or_else(|| crate::error::ModelError::UnknownNode(name.clone()))?;
            self.model.set_value(id, value.clone());
        }
        for gen in 0..self.model.generations().len() {
            for id in self.model.generations()[gen].clone() {
                self.model.recompute_deterministic(id);
            }
        }
        for (stepper, tuning) in self.steppers.iter_mut().zip(&state.tuning) {
            stepper.restore_tuning(tuning);
        }
        self.iteration = state.iteration;
        self.trace.truncate(state.save_index);
        self.state = SamplerState::Paused;
        Ok(())
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .expect("static progress template")
        .progress_chars("##-")
}

/// Runs `n_chains` fully independent chains in parallel.
///
/// `factory` builds one sampler per chain index; each chain owns its model,
/// steppers, and trace, and is seeded `seed + chain_index` so runs are
/// reproducible. Traces are returned in chain order once every chain has
/// finished.
pub fn sample_chains<F>(
    factory: F,
    n_chains: usize,
    opts: &SampleOptions,
    seed: u64,
) -> Result<Vec<MemoryTrace>, McmcError>
where
    F: Fn(usize) -> Mcmc + Sync,
{
    let multi = opts.progress.then(MultiProgress::new);
    (0..n_chains)
        .into_par_iter()
        .map(|i| {
            let mut mcmc = factory(i).set_seed(seed + i as u64);
            let mut opts = opts.clone();
            opts.progress = false;
            let bar = multi.as_ref().map(|m| {
                let pb = m.add(ProgressBar::new(opts.iter));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(progress_style());
                pb
            });
            mcmc.begin(opts)?;
            mcmc.run_to_end(bar.as_ref())?;
            if let Some(pb) = bar {
                pb.finish_with_message("done");
            }
            Ok(mcmc.into_trace())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{CustomDist, NormalDist, Param};
    use crate::model::ModelBuilder;

    fn simple_model() -> Model {
        ModelBuilder::new()
            .stochastic("mu", NormalDist::new(0.0.into(), 2.0.into()), 0.0, &[])
            .observed(
                "y",
                NormalDist::new(Param::Parent(0), Param::Const(1.0)),
                1.0,
                &["mu"],
            )
            .build()
            .unwrap()
    }

    #[test]
    fn trace_length_invariant() {
        // floor((iter - burn - 1) / thin) + 1 = floor((10-3-1)/2)+1 = 4
        let mut mcmc = Mcmc::new(simple_model()).set_seed(1);
        mcmc.sample(SampleOptions::new(10).burn(3).thin(2)).unwrap();
        assert_eq!(mcmc.state(), SamplerState::Finished);
        let expected = ((10 - 3 - 1) / 2 + 1) as usize;
        assert_eq!(TraceStorage::len(mcmc.trace()), expected);
        mcmc.trace().check_equal_lengths(expected).unwrap();
        // Variables, tuning diagnostics, and deviance are all tallied.
        let names = mcmc.trace().names();
        assert!(names.contains(&"mu"));
        assert!(names.contains(&"metropolis_mu_adaptive_scale"));
        assert!(names.contains(&"deviance"));
    }

    #[test]
    fn pause_resume_loses_nothing() {
        let mut mcmc = Mcmc::new(simple_model()).set_seed(2);
        mcmc.begin(SampleOptions::new(20).burn(0)).unwrap();
        for _ in 0..5 {
            mcmc.advance().unwrap();
        }
        mcmc.pause().unwrap();
        // advance is a no-op while paused.
        assert_eq!(mcmc.advance().unwrap(), SamplerState::Paused);
        assert_eq!(mcmc.iteration(), 5);
        mcmc.resume().unwrap();
        while mcmc.advance().unwrap() != SamplerState::Finished {}
        assert_eq!(mcmc.iteration(), 20);
        assert_eq!(TraceStorage::len(mcmc.trace()), 20);
    }

    #[test]
    fn halt_leaves_consistent_trace() {
        let mut mcmc = Mcmc::new(simple_model()).set_seed(3);
        mcmc.begin(SampleOptions::new(100)).unwrap();
        for _ in 0..7 {
            mcmc.advance().unwrap();
        }
        mcmc.halt();
        assert_eq!(mcmc.state(), SamplerState::Halted);
        let len = TraceStorage::len(mcmc.trace());
        assert_eq!(len, 7);
        mcmc.trace().check_equal_lengths(len).unwrap();
        // A halted chain refuses to advance.
        assert!(mcmc.advance().is_err());
    }

    #[test]
    fn step_error_halts_and_surfaces() {
        let fragile = CustomDist::new(|v: &Value, _: &[&Value]| match v.as_f64() {
            Some(x) if x.abs() < 0.1 => 0.0,
            _ => f64::NAN,
        });
        let model = ModelBuilder::new()
            .stochastic("x", fragile, 0.0, &[])
            .build()
            .unwrap();
        let mut mcmc = Mcmc::new(model).set_seed(4);
        let err = mcmc
            .sample(SampleOptions::new(1000))
            .expect_err("wide proposals must hit the undefined region");
        assert!(matches!(err, McmcError::Step(StepError::ProposalDomain { .. })));
        assert_eq!(mcmc.state(), SamplerState::Halted);
        let len = TraceStorage::len(mcmc.trace());
        mcmc.trace().check_equal_lengths(len).unwrap();
    }

    #[test]
    fn snapshot_and_restore_resume_exactly() {
        let mut mcmc = Mcmc::new(simple_model()).set_seed(5);
        mcmc.begin(SampleOptions::new(50).save_interval(10)).unwrap();
        for _ in 0..30 {
            mcmc.advance().unwrap();
        }
        assert_eq!(mcmc.snapshots().len(), 3);
        let snap = mcmc.snapshot();
        let mu_at_snap = snap.values["mu"].clone();

        for _ in 0..10 {
            mcmc.advance().unwrap();
        }
        mcmc.restore(&snap).unwrap();
        assert_eq!(mcmc.iteration(), 30);
        assert_eq!(TraceStorage::len(mcmc.trace()), 30);
        let mu = mcmc.model().node_id("mu").unwrap();
        assert_eq!(mcmc.model().node(mu).value(), &mu_at_snap);

        mcmc.resume().unwrap();
        while mcmc.advance().unwrap() != SamplerState::Finished {}
        assert_eq!(TraceStorage::len(mcmc.trace()), 50);
    }

    #[test]
    fn user_trace_fn_is_tallied() {
        let mut mcmc = Mcmc::new(simple_model())
            .set_seed(6)
            .register_trace_fn("mu_squared", |model: &Model| {
                let mu = model.node_id("mu").unwrap();
                let x = model.node(mu).value().as_f64().unwrap();
                Value::F64(x * x)
            });
        mcmc.sample(SampleOptions::new(10)).unwrap();
        let mu = mcmc.trace().as_f64("mu").unwrap();
        let mu2 = mcmc.trace().as_f64("mu_squared").unwrap();
        for (a, b) in mu.iter().zip(mu2.iter()) {
            assert!((a * a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn explicit_steppers_run_before_automatic() {
        let model = ModelBuilder::new()
            .stochastic("a", NormalDist::new(0.0.into(), 1.0.into()), 0.0, &[])
            .stochastic("b", NormalDist::new(0.0.into(), 1.0.into()), 0.0, &[])
            .build()
            .unwrap();
        let a = model.node_id("a").unwrap();
        let explicit = crate::steppers::Metropolis::new(&model, a).proposal_sd(0.5);
        let mut mcmc = Mcmc::new(model)
            .set_seed(7)
            .use_step(Stepper::Metropolis(explicit));
        mcmc.sample(SampleOptions::new(10)).unwrap();
        // Both variables got a stepper; only one was automatic.
        assert!(mcmc.trace().as_f64("a").is_ok());
        assert!(mcmc.trace().as_f64("b").is_ok());
        assert_eq!(mcmc.steppers.len(), 2);
        assert_eq!(mcmc.steppers[0].variables(), vec![a]);
    }

    #[test]
    fn parallel_chains_share_nothing() {
        let traces = sample_chains(
            |_| Mcmc::new(simple_model()),
            3,
            &SampleOptions::new(50).burn(10),
            123,
        )
        .unwrap();
        assert_eq!(traces.len(), 3);
        for trace in &traces {
            assert_eq!(TraceStorage::len(trace), 40);
        }
        // Different seeds produce different chains.
        let a = traces[0].as_f64("mu").unwrap();
        let b = traces[1].as_f64("mu").unwrap();
        assert_ne!(a, b);
    }
}
