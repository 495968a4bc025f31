/*!
# Step methods

One [`Stepper`] updates one or more stochastic nodes by a single Markov
transition. The set of variants is closed: [`Metropolis`],
[`DiscreteMetropolis`], [`BinaryMetropolis`], and [`AdaptiveMetropolis`].
Each variant exposes a static `competence` score in `0..=3`; automatic
assignment walks an ordered table and instantiates the variant with the
strictly highest score, first registered winning ties.

All Metropolis-style variants share the same acceptance machinery: the
Markov-blanket log-probability is evaluated before and after the proposal,
the move is accepted with probability `min(1, exp(delta + hastings))`, and a
rejected proposal restores the node value and every dependent deterministic
value from clones taken before the move, so the restore is bit-for-bit.

Tuning follows a bracketed rule on the acceptance ratio since the last tune
(thresholds documented in DESIGN.md): the `adaptive_scale_factor` is left
unchanged inside the 0.2–0.5 target band, so a chain that is already mixing
well is a fixed point of `tune`.
*/

use ndarray::{Array1, Array2};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::{Distribution as RandDistribution, Poisson, StandardNormal};

use crate::error::StepError;
use crate::model::Model;
use crate::node::{NodeId, Value};

/// Accepted/rejected counts since the last tune.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AcceptanceTracker {
    pub accepted: u64,
    pub rejected: u64,
}

impl AcceptanceTracker {
    fn record(&mut self, accepted: bool) {
        if accepted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
    }

    fn total(&self) -> u64 {
        self.accepted + self.rejected
    }

    fn ratio(&self) -> f64 {
        self.accepted as f64 / self.total() as f64
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The bracketed scale rule: below the target band the proposal shrinks,
/// above it grows, inside `[0.2, 0.5]` it stays put.
fn scale_multiplier(acceptance: f64) -> f64 {
    if acceptance < 0.001 {
        0.1
    } else if acceptance < 0.05 {
        0.5
    } else if acceptance < 0.2 {
        0.9
    } else if acceptance > 0.95 {
        10.0
    } else if acceptance > 0.75 {
        2.0
    } else if acceptance > 0.5 {
        1.1
    } else {
        1.0
    }
}

/// Shared bracketed tune on a tracker/scale pair. Returns whether the scale
/// changed; with no proposals since the last tune it is a no-op.
fn bracketed_tune(tracker: &mut AcceptanceTracker, scale: &mut f64, label: &str) -> bool {
    if tracker.total() == 0 {
        return false;
    }
    let ratio = tracker.ratio();
    let mult = scale_multiplier(ratio);
    tracker.reset();
    if mult == 1.0 {
        return false;
    }
    *scale *= mult;
    log::debug!("{label}: acceptance {ratio:.3}, scale factor now {scale:.4}");
    true
}

fn metropolis_accept(log_ratio: f64, rng: &mut SmallRng) -> bool {
    let u: f64 = rng.gen();
    log_ratio > u.ln()
}

/// Clones of a node set's values, taken before a proposal so a rejection can
/// restore them exactly.
fn snapshot(model: &Model, ids: &[NodeId]) -> Vec<(NodeId, Value)> {
    ids.iter()
        .map(|&id| (id, model.node(id).value().clone()))
        .collect()
}

fn restore(model: &mut Model, snap: Vec<(NodeId, Value)>) {
    for (id, value) in snap {
        model.set_value(id, value);
    }
}

/// Deep copy of a stepper's mutable tuning state, stored inside chain-state
/// snapshots for resumable sampling.
#[derive(Debug, Clone)]
pub enum TuningState {
    Scalar {
        adaptive_scale_factor: f64,
        tracker_accepted: u64,
        tracker_rejected: u64,
    },
    Adaptive {
        adaptive_scale_factor: f64,
        cov: Array2<f64>,
        mean: Array1<f64>,
        scatter: Array2<f64>,
        count: u64,
        iterations: u64,
        accepted_total: u64,
        warmed_up: bool,
        adapting: bool,
    },
}

// ---------------------------------------------------------------------------
// Metropolis
// ---------------------------------------------------------------------------

/// Proposal kernel for [`Metropolis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetropolisProposal {
    /// Symmetric normal perturbation; Hastings factor zero.
    Symmetric,
    /// Redraw from the node's own distribution; Hastings factor is the log
    /// ratio of backward/forward proposal densities.
    Prior,
}

/// Random-walk Metropolis for continuous scalar or array nodes.
pub struct Metropolis {
    node: NodeId,
    label: String,
    pub proposal_sd: f64,
    pub adaptive_scale_factor: f64,
    proposal: MetropolisProposal,
    tracker: AcceptanceTracker,
}

impl Metropolis {
    pub fn new(model: &Model, node: NodeId) -> Self {
        let label = format!("metropolis_{}", model.node(node).name());
        Self {
            node,
            label,
            proposal_sd: 1.0,
            adaptive_scale_factor: 1.0,
            proposal: MetropolisProposal::Symmetric,
            tracker: AcceptanceTracker::default(),
        }
    }

    pub fn proposal_sd(mut self, sd: f64) -> Self {
        self.proposal_sd = sd;
        self
    }

    pub fn proposal(mut self, proposal: MetropolisProposal) -> Self {
        self.proposal = proposal;
        self
    }

    /// Suitability for `node`: 1 for any free float-valued stochastic, 0
    /// otherwise. Low on purpose so specialized methods outrank it.
    pub fn competence(node: &crate::node::Node) -> u8 {
        if node.is_free_stochastic() && node.value().is_float() {
            1
        } else {
            0
        }
    }

    fn step(&mut self, model: &mut Model, rng: &mut SmallRng) -> Result<bool, StepError> {
        let node = self.node;
        let name = model.node(node).name().to_string();
        let lp_before = model.blanket_logp(node);
        if lp_before.is_nan() {
            return Err(StepError::ProposalDomain { node: name });
        }

        let dets = model.blanket(node).det_updates.clone();
        let mut saved = snapshot(model, &dets);
        saved.push((node, model.node(node).value().clone()));

        let scale = self.proposal_sd * self.adaptive_scale_factor;
        let (proposed, hastings) = match self.proposal {
            MetropolisProposal::Symmetric => {
                let current = model.node(node).value();
                let proposed = match current {
                    Value::F64(x) => {
                        let z: f64 = rng.sample(StandardNormal);
                        Value::F64(x + scale * z)
                    }
                    Value::ArrF64(a) => Value::ArrF64(
                        a.iter()
                            .map(|&x| {
                                let z: f64 = rng.sample(StandardNormal);
                                x + scale * z
                            })
                            .collect(),
                    ),
                    other => {
                        return Err(StepError::IncompatibleNode {
                            method: "Metropolis",
                            node: name,
                            reason: format!("expected float value, got {other:?}"),
                        })
                    }
                };
                (proposed, 0.0)
            }
            MetropolisProposal::Prior => {
                let old = model.node(node).value().clone();
                let proposed = model.draw_node(node, rng).ok_or_else(|| {
                    StepError::IncompatibleNode {
                        method: "Metropolis",
                        node: name.clone(),
                        reason: "prior proposal requires a random-capable node".into(),
                    }
                })?;
                // q(new) = prior(new), q(old) = prior(old)
                let hastings = model.node_dist_logp(node, &old) - model.node_dist_logp(node, &proposed);
                (proposed, hastings)
            }
        };

        model.set_value(node, proposed);
        model.refresh_blanket(node);
        let lp_after = model.blanket_logp(node);

        if lp_after.is_nan() || hastings.is_nan() {
            restore(model, saved);
            return Err(StepError::ProposalDomain { node: name });
        }

        let accepted = metropolis_accept(lp_after - lp_before + hastings, rng);
        if !accepted {
            restore(model, saved);
        }
        self.tracker.record(accepted);
        Ok(accepted)
    }
}

// ---------------------------------------------------------------------------
// DiscreteMetropolis
// ---------------------------------------------------------------------------

/// Proposal kernel for [`DiscreteMetropolis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscreteProposal {
    /// Continuous normal perturbation rounded to the nearest integer.
    Normal,
    /// Adds or subtracts (fair coin) a Poisson-distributed increment.
    Poisson,
    /// Redraw from the node's own distribution.
    Prior,
}

/// Metropolis over integer-valued nodes.
pub struct DiscreteMetropolis {
    node: NodeId,
    label: String,
    pub proposal_sd: f64,
    pub adaptive_scale_factor: f64,
    proposal: DiscreteProposal,
    tracker: AcceptanceTracker,
}

impl DiscreteMetropolis {
    pub fn new(model: &Model, node: NodeId) -> Self {
        let label = format!("discrete_metropolis_{}", model.node(node).name());
        Self {
            node,
            label,
            proposal_sd: 1.0,
            adaptive_scale_factor: 1.0,
            proposal: DiscreteProposal::Poisson,
            tracker: AcceptanceTracker::default(),
        }
    }

    pub fn proposal_sd(mut self, sd: f64) -> Self {
        self.proposal_sd = sd;
        self
    }

    pub fn proposal(mut self, proposal: DiscreteProposal) -> Self {
        self.proposal = proposal;
        self
    }

    /// 2 for free integer-valued stochastics, 0 otherwise.
    pub fn competence(node: &crate::node::Node) -> u8 {
        if node.is_free_stochastic() && node.value().is_integer() {
            2
        } else {
            0
        }
    }

    fn propose_elem(&self, k: i64, rng: &mut SmallRng) -> i64 {
        let scale = self.proposal_sd * self.adaptive_scale_factor;
        match self.proposal {
            DiscreteProposal::Normal => {
                let z: f64 = rng.sample(StandardNormal);
                k + (scale * z).round() as i64
            }
            DiscreteProposal::Poisson => {
                let rate = scale.max(f64::MIN_POSITIVE);
                let jump = Poisson::new(rate)
                    .map(|p| p.sample(rng) as i64)
                    .unwrap_or(0);
                if rng.gen::<bool>() {
                    k + jump
                } else {
                    k - jump
                }
            }
            DiscreteProposal::Prior => unreachable!("prior handled in step"),
        }
    }

    fn step(&mut self, model: &mut Model, rng: &mut SmallRng) -> Result<bool, StepError> {
        let node = self.node;
        let name = model.node(node).name().to_string();
        let lp_before = model.blanket_logp(node);
        if lp_before.is_nan() {
            return Err(StepError::ProposalDomain { node: name });
        }

        let dets = model.blanket(node).det_updates.clone();
        let mut saved = snapshot(model, &dets);
        saved.push((node, model.node(node).value().clone()));

        let (proposed, hastings) = if self.proposal == DiscreteProposal::Prior {
            let old = model.node(node).value().clone();
            let proposed = model.draw_node(node, rng).ok_or_else(|| {
                StepError::IncompatibleNode {
                    method: "DiscreteMetropolis",
                    node: name.clone(),
                    reason: "prior proposal requires a random-capable node".into(),
                }
            })?;
            let hastings = model.node_dist_logp(node, &old) - model.node_dist_logp(node, &proposed);
            (proposed, hastings)
        } else {
            let proposed = match model.node(node).value() {
                Value::I64(k) => Value::I64(self.propose_elem(*k, rng)),
                Value::ArrI64(a) => {
                    Value::ArrI64(a.iter().map(|&k| self.propose_elem(k, rng)).collect())
                }
                other => {
                    return Err(StepError::IncompatibleNode {
                        method: "DiscreteMetropolis",
                        node: name,
                        reason: format!("expected integer value, got {other:?}"),
                    })
                }
            };
            (proposed, 0.0)
        };

        model.set_value(node, proposed);
        model.refresh_blanket(node);
        let lp_after = model.blanket_logp(node);

        if lp_after.is_nan() || hastings.is_nan() {
            restore(model, saved);
            return Err(StepError::ProposalDomain { node: name });
        }

        let accepted = metropolis_accept(lp_after - lp_before + hastings, rng);
        if !accepted {
            restore(model, saved);
        }
        self.tracker.record(accepted);
        Ok(accepted)
    }
}

// ---------------------------------------------------------------------------
// BinaryMetropolis
// ---------------------------------------------------------------------------

/// Step method for boolean nodes.
///
/// Array values: each element is independently flipped with probability
/// `p_jump * adaptive_scale_factor` and the whole array is accepted or
/// rejected as one block. Scalar values: the Markov blanket is evaluated
/// under both states and the new value is drawn directly from the resulting
/// two-point distribution, with no accept/reject step and no tuning.
pub struct BinaryMetropolis {
    node: NodeId,
    label: String,
    pub p_jump: f64,
    pub adaptive_scale_factor: f64,
    propose_from_prior: bool,
    tracker: AcceptanceTracker,
}

impl BinaryMetropolis {
    pub fn new(model: &Model, node: NodeId) -> Self {
        let label = format!("binary_metropolis_{}", model.node(node).name());
        Self {
            node,
            label,
            p_jump: 0.1,
            adaptive_scale_factor: 1.0,
            propose_from_prior: false,
            tracker: AcceptanceTracker::default(),
        }
    }

    pub fn p_jump(mut self, p: f64) -> Self {
        self.p_jump = p;
        self
    }

    /// Redraw the whole array from the node's own distribution instead of
    /// flipping elements.
    pub fn propose_from_prior(mut self, yes: bool) -> Self {
        self.propose_from_prior = yes;
        self
    }

    /// 2 for free boolean-valued stochastics, 0 otherwise.
    pub fn competence(node: &crate::node::Node) -> u8 {
        if node.is_free_stochastic() && node.value().is_bool() {
            2
        } else {
            0
        }
    }

    fn is_scalar(&self, model: &Model) -> bool {
        matches!(model.node(self.node).value(), Value::Bool(_))
    }

    /// Exact two-point draw for a scalar boolean node.
    fn gibbs_step(&mut self, model: &mut Model, rng: &mut SmallRng) -> Result<bool, StepError> {
        let node = self.node;
        let name = model.node(node).name().to_string();
        let original = model.node(node).value().clone();
        let dets = model.blanket(node).det_updates.clone();
        let saved = snapshot(model, &dets);

        model.set_value(node, Value::Bool(false));
        model.refresh_blanket(node);
        let lp_false = model.blanket_logp(node);

        model.set_value(node, Value::Bool(true));
        model.refresh_blanket(node);
        let lp_true = model.blanket_logp(node);

        if lp_false.is_nan()
            || lp_true.is_nan()
            || (lp_false == f64::NEG_INFINITY && lp_true == f64::NEG_INFINITY)
        {
            model.set_value(node, original);
            restore(model, saved);
            model.refresh_blanket(node);
            return Err(StepError::ProposalDomain { node: name });
        }

        // p(true) = 1 / (1 + exp(lp_false - lp_true)), stable at the extremes.
        let p_true = 1.0 / (1.0 + (lp_false - lp_true).exp());
        let value = rng.gen::<f64>() < p_true;
        model.set_value(node, Value::Bool(value));
        model.refresh_blanket(node);
        Ok(true)
    }

    fn step(&mut self, model: &mut Model, rng: &mut SmallRng) -> Result<bool, StepError> {
        if self.is_scalar(model) {
            return self.gibbs_step(model, rng);
        }

        let node = self.node;
        let name = model.node(node).name().to_string();
        let lp_before = model.blanket_logp(node);
        if lp_before.is_nan() {
            return Err(StepError::ProposalDomain { node: name });
        }

        let dets = model.blanket(node).det_updates.clone();
        let mut saved = snapshot(model, &dets);
        saved.push((node, model.node(node).value().clone()));

        let (proposed, hastings) = if self.propose_from_prior {
            let old = model.node(node).value().clone();
            let proposed = model.draw_node(node, rng).ok_or_else(|| {
                StepError::IncompatibleNode {
                    method: "BinaryMetropolis",
                    node: name.clone(),
                    reason: "prior proposal requires a random-capable node".into(),
                }
            })?;
            let hastings = model.node_dist_logp(node, &old) - model.node_dist_logp(node, &proposed);
            (proposed, hastings)
        } else {
            let p_flip = (self.p_jump * self.adaptive_scale_factor).min(1.0);
            let proposed = match model.node(node).value() {
                Value::ArrBool(a) => Value::ArrBool(
                    a.iter()
                        .map(|&b| if rng.gen::<f64>() < p_flip { !b } else { b })
                        .collect(),
                ),
                other => {
                    return Err(StepError::IncompatibleNode {
                        method: "BinaryMetropolis",
                        node: name,
                        reason: format!("expected boolean value, got {other:?}"),
                    })
                }
            };
            (proposed, 0.0)
        };

        model.set_value(node, proposed);
        model.refresh_blanket(node);
        let lp_after = model.blanket_logp(node);

        if lp_after.is_nan() || hastings.is_nan() {
            restore(model, saved);
            return Err(StepError::ProposalDomain { node: name });
        }

        let accepted = metropolis_accept(lp_after - lp_before + hastings, rng);
        if !accepted {
            restore(model, saved);
        }
        self.tracker.record(accepted);
        Ok(accepted)
    }
}

// ---------------------------------------------------------------------------
// AdaptiveMetropolis
// ---------------------------------------------------------------------------

/// Haario-style proposal scale applied to the empirical covariance.
const AM_SCALE_NUM: f64 = 2.4 * 2.4;
const AM_EPS: f64 = 1e-5;
/// Rolling acceptance below this collapses the covariance toward its
/// diagonal when `shrink_if_necessary` is set.
const AM_SHRINK_THRESHOLD: f64 = 0.001;

/// Joint Metropolis over several float nodes with an adaptively estimated
/// proposal covariance.
///
/// Phases: until `delay` iterations (or, in greedy mode, `delay` *accepted*
/// proposals) the initial covariance is used unchanged; then the proposal
/// covariance is replaced by the empirical covariance of the chain so far
/// and refreshed every `interval` iterations from incrementally maintained
/// moments. The kernel depends on history, so the sampler freezes adaptation
/// when its tuning schedule ends to preserve the diminishing-adaptation
/// guarantee.
pub struct AdaptiveMetropolis {
    nodes: Vec<NodeId>,
    label: String,
    dim: usize,
    elems: Vec<usize>,
    det_updates: Vec<NodeId>,
    factors: Vec<NodeId>,
    pub delay: u64,
    pub interval: u64,
    pub greedy: bool,
    pub shrink_if_necessary: bool,
    pub adaptive_scale_factor: f64,
    cov: Array2<f64>,
    chol: Array2<f64>,
    mean: Array1<f64>,
    scatter: Array2<f64>,
    count: u64,
    iterations: u64,
    accepted_total: u64,
    warmed_up: bool,
    adapting: bool,
    tracker: AcceptanceTracker,
}

impl AdaptiveMetropolis {
    /// Creates a joint stepper over `nodes`, all of which must hold float
    /// values. `scales` gives per-node relative scales for the initial
    /// diagonal covariance, `diag = (scale_i * initial_value_i)^2`; with no
    /// scales the identity is used.
    pub fn new(
        model: &Model,
        nodes: Vec<NodeId>,
        scales: Option<Vec<f64>>,
    ) -> Result<Self, StepError> {
        assert!(!nodes.is_empty(), "AdaptiveMetropolis needs at least one node");
        let mut elems = Vec::with_capacity(nodes.len());
        for &id in &nodes {
            let node = model.node(id);
            if !node.value().is_float() {
                return Err(StepError::IncompatibleNode {
                    method: "AdaptiveMetropolis",
                    node: node.name().to_string(),
                    reason: format!("expected float value, got {:?}", node.value()),
                });
            }
            elems.push(node.value().len());
        }
        let dim: usize = elems.iter().sum();

        let cov = match scales {
            Some(scales) => {
                assert_eq!(
                    scales.len(),
                    nodes.len(),
                    "one scale per node expected"
                );
                let mut diag = Array2::<f64>::zeros((dim, dim));
                let mut offset = 0;
                for (scale, &id) in scales.iter().zip(&nodes) {
                    for x in model.node(id).value().to_f64_vec() {
                        let sd = scale * x;
                        // Zero initial values would freeze the component.
                        let sd = if sd.abs() > 0.0 { sd } else { *scale };
                        diag[(offset, offset)] = sd * sd;
                        offset += 1;
                    }
                }
                diag
            }
            None => Array2::<f64>::eye(dim),
        };

        let (det_updates, factors) = union_blanket(model, &nodes);
        let label = {
            let names: Vec<&str> = nodes.iter().map(|&id| model.node(id).name()).collect();
            format!("adaptive_metropolis_{}", names.join("_"))
        };
        let chol = cholesky_or_jitter(&cov).ok_or_else(|| StepError::IncompatibleNode {
            method: "AdaptiveMetropolis",
            node: label.clone(),
            reason: "initial covariance is not positive definite".into(),
        })?;

        Ok(Self {
            nodes,
            label,
            dim,
            elems,
            det_updates,
            factors,
            delay: 1000,
            interval: 200,
            greedy: true,
            shrink_if_necessary: false,
            adaptive_scale_factor: 1.0,
            cov,
            chol,
            mean: Array1::zeros(dim),
            scatter: Array2::zeros((dim, dim)),
            count: 0,
            iterations: 0,
            accepted_total: 0,
            warmed_up: false,
            adapting: true,
            tracker: AcceptanceTracker::default(),
        })
    }

    /// Uses a full user-supplied initial covariance instead of the scale
    /// heuristic.
    pub fn initial_cov(mut self, cov: Array2<f64>) -> Self {
        assert_eq!(cov.nrows(), self.dim);
        assert_eq!(cov.ncols(), self.dim);
        self.chol = cholesky_or_jitter(&cov).expect("initial covariance must be positive definite");
        self.cov = cov;
        self
    }

    pub fn delay(mut self, delay: u64) -> Self {
        self.delay = delay;
        self
    }

    pub fn interval(mut self, interval: u64) -> Self {
        self.interval = interval;
        self
    }

    pub fn greedy(mut self, greedy: bool) -> Self {
        self.greedy = greedy;
        self
    }

    pub fn shrink_if_necessary(mut self, shrink: bool) -> Self {
        self.shrink_if_necessary = shrink;
        self
    }

    /// Never chosen automatically; joint blocking is an explicit modeling
    /// decision.
    pub fn competence(_node: &crate::node::Node) -> u8 {
        0
    }

    /// The covariance the next proposal will be drawn from.
    pub fn proposal_cov(&self) -> &Array2<f64> {
        &self.cov
    }

    fn flat_value(&self, model: &Model) -> Array1<f64> {
        let mut flat = Vec::with_capacity(self.dim);
        for &id in &self.nodes {
            flat.extend(model.node(id).value().to_f64_vec());
        }
        Array1::from_vec(flat)
    }

    fn write_flat(&self, model: &mut Model, flat: &Array1<f64>) {
        let mut offset = 0;
        for (&id, &len) in self.nodes.iter().zip(&self.elems) {
            let slice = &flat.as_slice().expect("contiguous")[offset..offset + len];
            let rebuilt = model
                .node(id)
                .value()
                .from_f64_slice_like(slice)
                .expect("float node");
            model.set_value(id, rebuilt);
            offset += len;
        }
    }

    fn blanket_logp(&self, model: &Model) -> f64 {
        self.factors.iter().map(|&f| model.node_logp(f)).sum()
    }

    /// Welford update of the running mean and scatter matrix. Incremental by
    /// construction: the full history is never revisited.
    fn update_moments(&mut self, x: &Array1<f64>) {
        self.count += 1;
        let n = self.count as f64;
        let delta = x - &self.mean;
        self.mean = &self.mean + &(&delta / n);
        let delta2 = x - &self.mean;
        for i in 0..self.dim {
            for j in 0..self.dim {
                self.scatter[(i, j)] += delta[i] * delta2[j];
            }
        }
    }

    fn empirical_cov(&self) -> Option<Array2<f64>> {
        if self.count < 2 {
            return None;
        }
        Some(&self.scatter / (self.count as f64 - 1.0))
    }

    fn refresh_proposal_cov(&mut self) {
        let Some(emp) = self.empirical_cov() else {
            return;
        };
        let sd = AM_SCALE_NUM / self.dim as f64;
        let mut cov = emp * sd;
        for i in 0..self.dim {
            cov[(i, i)] += AM_EPS;
        }
        if let Some(chol) = cholesky_or_jitter(&cov) {
            self.cov = cov;
            self.chol = chol;
        } else {
            log::warn!("{}: covariance update not positive definite, keeping previous", self.label);
        }
    }

    fn shrink_cov(&mut self) {
        log::warn!(
            "{}: acceptance collapsed, shrinking proposal covariance toward its diagonal",
            self.label
        );
        let mut cov = Array2::<f64>::zeros((self.dim, self.dim));
        for i in 0..self.dim {
            cov[(i, i)] = (self.cov[(i, i)] * 0.01).max(AM_EPS);
        }
        if let Some(chol) = cholesky_or_jitter(&cov) {
            self.cov = cov;
            self.chol = chol;
        }
    }

    fn step(&mut self, model: &mut Model, rng: &mut SmallRng) -> Result<bool, StepError> {
        let lp_before = self.blanket_logp(model);
        if lp_before.is_nan() {
            return Err(StepError::ProposalDomain {
                node: self.label.clone(),
            });
        }

        let mut saved = snapshot(model, &self.det_updates);
        saved.extend(snapshot(model, &self.nodes));

        let x = self.flat_value(model);
        let z: Array1<f64> = (0..self.dim).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
        let step = self.chol.dot(&z) * self.adaptive_scale_factor;
        let proposed = &x + &step;

        self.write_flat(model, &proposed);
        for det in self.det_updates.clone() {
            model.recompute_deterministic(det);
        }
        let lp_after = self.blanket_logp(model);

        if lp_after.is_nan() {
            restore(model, saved);
            return Err(StepError::ProposalDomain {
                node: self.label.clone(),
            });
        }

        let accepted = metropolis_accept(lp_after - lp_before, rng);
        if !accepted {
            restore(model, saved);
        }
        self.tracker.record(accepted);
        self.iterations += 1;
        if accepted {
            self.accepted_total += 1;
        }

        if self.adapting {
            // Moments accumulate over the chain state, accepted or not.
            let state = self.flat_value(model);
            self.update_moments(&state);

            let warmup_done = if self.greedy {
                self.accepted_total >= self.delay
            } else {
                self.iterations >= self.delay
            };
            if !self.warmed_up {
                if warmup_done {
                    self.warmed_up = true;
                    self.refresh_proposal_cov();
                }
            } else if self.iterations % self.interval == 0 {
                self.refresh_proposal_cov();
                if self.shrink_if_necessary
                    && self.tracker.total() >= self.interval
                    && self.tracker.ratio() < AM_SHRINK_THRESHOLD
                {
                    self.shrink_cov();
                }
            }
        }

        Ok(accepted)
    }
}

/// Union of per-node blankets for a joint update: deterministic updates in
/// generation order, factors deduplicated.
fn union_blanket(model: &Model, nodes: &[NodeId]) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut det_updates: Vec<NodeId> = Vec::new();
    let mut factors: Vec<NodeId> = Vec::new();
    for &id in nodes {
        let blanket = model.blanket(id);
        for &det in &blanket.det_updates {
            if !det_updates.contains(&det) {
                det_updates.push(det);
            }
        }
        for &f in &blanket.factors {
            if !factors.contains(&f) {
                factors.push(f);
            }
        }
    }
    det_updates.sort_by_key(|&d| (model.gen_of(d), d));
    factors.sort();
    (det_updates, factors)
}

/// Lower-triangular Cholesky factor; retries once with diagonal jitter
/// before giving up.
fn cholesky_or_jitter(a: &Array2<f64>) -> Option<Array2<f64>> {
    cholesky(a).or_else(|| {
        let mut jittered = a.clone();
        for i in 0..a.nrows() {
            jittered[(i, i)] += AM_EPS;
        }
        cholesky(&jittered)
    })
}

fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[(i, j)];
            for k in 0..j {
                sum -= l[(i, k)] * l[(j, k)];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[(i, j)] = sum.sqrt();
            } else {
                l[(i, j)] = sum / l[(j, j)];
            }
        }
    }
    Some(l)
}

// ---------------------------------------------------------------------------
// Stepper: the closed set
// ---------------------------------------------------------------------------

/// The closed set of step-method variants.
pub enum Stepper {
    Metropolis(Metropolis),
    DiscreteMetropolis(DiscreteMetropolis),
    BinaryMetropolis(BinaryMetropolis),
    AdaptiveMetropolis(AdaptiveMetropolis),
}

impl Stepper {
    /// Performs one Markov transition over the owned variables. Returns
    /// whether the proposal was accepted; every node outside the owned set
    /// and its deterministic closure is left untouched.
    pub fn step(&mut self, model: &mut Model, rng: &mut SmallRng) -> Result<bool, StepError> {
        match self {
            Stepper::Metropolis(s) => s.step(model, rng),
            Stepper::DiscreteMetropolis(s) => s.step(model, rng),
            Stepper::BinaryMetropolis(s) => s.step(model, rng),
            Stepper::AdaptiveMetropolis(s) => s.step(model, rng),
        }
    }

    /// Adjusts the proposal scale from the acceptance ratio since the last
    /// tune. Returns whether anything changed.
    pub fn tune(&mut self, model: &Model) -> bool {
        match self {
            Stepper::Metropolis(s) => {
                bracketed_tune(&mut s.tracker, &mut s.adaptive_scale_factor, &s.label)
            }
            Stepper::DiscreteMetropolis(s) => {
                bracketed_tune(&mut s.tracker, &mut s.adaptive_scale_factor, &s.label)
            }
            Stepper::BinaryMetropolis(s) => {
                if s.is_scalar(model) {
                    false
                } else {
                    bracketed_tune(&mut s.tracker, &mut s.adaptive_scale_factor, &s.label)
                }
            }
            // Adaptation happens inside step(), on its own schedule.
            Stepper::AdaptiveMetropolis(_) => false,
        }
    }

    /// Freezes or unfreezes history-dependent adaptation; called by the
    /// sampler when its tuning schedule ends.
    pub fn set_adapting(&mut self, adapting: bool) {
        if let Stepper::AdaptiveMetropolis(s) = self {
            s.adapting = adapting;
        }
    }

    /// The nodes this stepper owns.
    pub fn variables(&self) -> Vec<NodeId> {
        match self {
            Stepper::Metropolis(s) => vec![s.node],
            Stepper::DiscreteMetropolis(s) => vec![s.node],
            Stepper::BinaryMetropolis(s) => vec![s.node],
            Stepper::AdaptiveMetropolis(s) => s.nodes.clone(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Stepper::Metropolis(s) => &s.label,
            Stepper::DiscreteMetropolis(s) => &s.label,
            Stepper::BinaryMetropolis(s) => &s.label,
            Stepper::AdaptiveMetropolis(s) => &s.label,
        }
    }

    /// The tuning diagnostic recorded alongside variable traces, or `None`
    /// for non-tunable steppers.
    pub fn tuning_value(&self, model: &Model) -> Option<f64> {
        match self {
            Stepper::Metropolis(s) => Some(s.adaptive_scale_factor),
            Stepper::DiscreteMetropolis(s) => Some(s.adaptive_scale_factor),
            Stepper::BinaryMetropolis(s) => {
                if s.is_scalar(model) {
                    None
                } else {
                    Some(s.adaptive_scale_factor)
                }
            }
            Stepper::AdaptiveMetropolis(s) => Some(s.adaptive_scale_factor),
        }
    }

    /// Deep copy of the mutable tuning state, for chain-state snapshots.
    pub fn tuning_state(&self) -> TuningState {
        match self {
            Stepper::Metropolis(s) => TuningState::Scalar {
                adaptive_scale_factor: s.adaptive_scale_factor,
                tracker_accepted: s.tracker.accepted,
                tracker_rejected: s.tracker.rejected,
            },
            Stepper::DiscreteMetropolis(s) => TuningState::Scalar {
                adaptive_scale_factor: s.adaptive_scale_factor,
                tracker_accepted: s.tracker.accepted,
                tracker_rejected: s.tracker.rejected,
            },
            Stepper::BinaryMetropolis(s) => TuningState::Scalar {
                adaptive_scale_factor: s.adaptive_scale_factor,
                tracker_accepted: s.tracker.accepted,
                tracker_rejected: s.tracker.rejected,
            },
            Stepper::AdaptiveMetropolis(s) => TuningState::Adaptive {
                adaptive_scale_factor: s.adaptive_scale_factor,
                cov: s.cov.clone(),
                mean: s.mean.clone(),
                scatter: s.scatter.clone(),
                count: s.count,
                iterations: s.iterations,
                accepted_total: s.accepted_total,
                warmed_up: s.warmed_up,
                adapting: s.adapting,
            },
        }
    }

    /// Restores state captured by [`Stepper::tuning_state`].
    pub fn restore_tuning(&mut self, state: &TuningState) {
        match (self, state) {
            (
                Stepper::Metropolis(s),
                TuningState::Scalar {
                    adaptive_scale_factor,
                    tracker_accepted,
                    tracker_rejected,
                },
            ) => {
                s.adaptive_scale_factor = *adaptive_scale_factor;
                s.tracker.accepted = *tracker_accepted;
                s.tracker.rejected = *tracker_rejected;
            }
            (
                Stepper::DiscreteMetropolis(s),
                TuningState::Scalar {
                    adaptive_scale_factor,
                    tracker_accepted,
                    tracker_rejected,
                },
            ) => {
                s.adaptive_scale_factor = *adaptive_scale_factor;
                s.tracker.accepted = *tracker_accepted;
                s.tracker.rejected = *tracker_rejected;
            }
            (
                Stepper::BinaryMetropolis(s),
                TuningState::Scalar {
                    adaptive_scale_factor,
                    tracker_accepted,
                    tracker_rejected,
                },
            ) => {
                s.adaptive_scale_factor = *adaptive_scale_factor;
                s.tracker.accepted = *tracker_accepted;
                s.tracker.rejected = *tracker_rejected;
            }
            (
                Stepper::AdaptiveMetropolis(s),
                TuningState::Adaptive {
                    adaptive_scale_factor,
                    cov,
                    mean,
                    scatter,
                    count,
                    iterations,
                    accepted_total,
                    warmed_up,
                    adapting,
                },
            ) => {
                s.adaptive_scale_factor = *adaptive_scale_factor;
                s.cov = cov.clone();
                s.chol = cholesky_or_jitter(cov).expect("restored covariance factorizes");
                s.mean = mean.clone();
                s.scatter = scatter.clone();
                s.count = *count;
                s.iterations = *iterations;
                s.accepted_total = *accepted_total;
                s.warmed_up = *warmed_up;
                s.adapting = *adapting;
            }
            _ => panic!("tuning state does not match stepper variant"),
        }
    }
}

type CompetenceFn = fn(&crate::node::Node) -> u8;

/// The ordered registry of automatically assignable step methods. First
/// entry wins competence ties.
const REGISTRY: &[(&str, CompetenceFn)] = &[
    ("metropolis", Metropolis::competence),
    ("discrete_metropolis", DiscreteMetropolis::competence),
    ("binary_metropolis", BinaryMetropolis::competence),
    ("adaptive_metropolis", AdaptiveMetropolis::competence),
];

/// Picks and instantiates the most competent step method for a node.
///
/// Every registered variant's competence is scored; the strictly highest
/// score wins, ties broken by registration order. A zero top score means no
/// method can handle the node.
pub fn assign_stepper(model: &Model, node: NodeId) -> Result<Stepper, StepError> {
    let n = model.node(node);
    let mut best: Option<(usize, u8)> = None;
    for (idx, (_, competence)) in REGISTRY.iter().enumerate() {
        let score = competence(n);
        let beats = match best {
            Some((_, top)) => score > top,
            None => score > 0,
        };
        if beats {
            best = Some((idx, score));
        }
    }
    match best {
        Some((0, _)) => Ok(Stepper::Metropolis(Metropolis::new(model, node))),
        Some((1, _)) => Ok(Stepper::DiscreteMetropolis(DiscreteMetropolis::new(
            model, node,
        ))),
        Some((2, _)) => Ok(Stepper::BinaryMetropolis(BinaryMetropolis::new(model, node))),
        Some((3, _)) => Ok(Stepper::AdaptiveMetropolis(
            AdaptiveMetropolis::new(model, vec![node], None)?,
        )),
        _ => Err(StepError::NoCompetentMethod(n.name().to_string())),
    }
}
