/*!
# Model graph

A [`Model`] owns an arena of [`Node`]s partitioned by kind, the topological
`generations` needed to evaluate them in dependency order, and the
Markov-blanket index step methods use to score proposals.

Models are assembled through [`ModelBuilder`], which accepts declarations in
any order (parents may be declared after their children), validates names,
wires parent/child indices, and fails with a construction error rather than
producing a partial model.

# Examples

```rust
use graph_mcmc::distributions::{NormalDist, Param};
use graph_mcmc::model::ModelBuilder;

let model = ModelBuilder::new()
    .stochastic("mu", NormalDist::new(Param::Const(0.0), Param::Const(10.0)), 0.0, &[])
    .observed("y", NormalDist::new(Param::Parent(0), Param::Const(1.0)), 2.5, &["mu"])
    .build()
    .unwrap();
assert_eq!(model.free_stochastics().len(), 1);
```
*/

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::rngs::SmallRng;

use crate::distributions::{DeterministicFn, Distribution, PotentialFn};
use crate::error::ModelError;
use crate::node::{Node, NodeBehavior, NodeId, NodeKind, Value};

/// Everything a step method needs to know about one free stochastic node:
/// which deterministic nodes must be refreshed after its value changes, and
/// which log-probability factors its update touches.
#[derive(Debug, Clone)]
pub(crate) struct Blanket {
    /// Deterministic descendants, in generation order.
    pub det_updates: Vec<NodeId>,
    /// The node itself plus every stochastic/potential node whose
    /// log-probability depends on it (directly or through `det_updates`).
    pub factors: Vec<NodeId>,
}

/// A probability model: an arena of nodes plus derived structure.
#[derive(Debug)]
pub struct Model {
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
    free_stochastics: Vec<NodeId>,
    observed: Vec<NodeId>,
    deterministics: Vec<NodeId>,
    potentials: Vec<NodeId>,
    generations: Vec<Vec<NodeId>>,
    blankets: HashMap<NodeId, Blanket>,
    /// Generation index per node, for ordering blanket recomputation.
    gen_of: Vec<usize>,
}

enum DeclBehavior {
    Stochastic {
        dist: Box<dyn Distribution>,
        observed: bool,
    },
    Deterministic {
        f: Box<dyn DeterministicFn>,
    },
    Potential {
        f: Box<dyn PotentialFn>,
    },
}

struct NodeDecl {
    name: String,
    behavior: DeclBehavior,
    init: Value,
    parents: Vec<String>,
}

/// Accumulates node declarations and builds a validated [`Model`].
#[derive(Default)]
pub struct ModelBuilder {
    decls: Vec<NodeDecl>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an unobserved stochastic node with an initial value.
    /// `parents` are node names; distribution parameters reference them by
    /// position via `Param::Parent`.
    pub fn stochastic(
        mut self,
        name: &str,
        dist: impl Distribution + 'static,
        init: impl Into<Value>,
        parents: &[&str],
    ) -> Self {
        self.decls.push(NodeDecl {
            name: name.to_string(),
            behavior: DeclBehavior::Stochastic {
                dist: Box::new(dist),
                observed: false,
            },
            init: init.into(),
            parents: parents.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Declares an observed stochastic node holding fixed data. Observed
    /// nodes contribute to the joint log-probability but are never updated.
    pub fn observed(
        mut self,
        name: &str,
        dist: impl Distribution + 'static,
        data: impl Into<Value>,
        parents: &[&str],
    ) -> Self {
        self.decls.push(NodeDecl {
            name: name.to_string(),
            behavior: DeclBehavior::Stochastic {
                dist: Box::new(dist),
                observed: true,
            },
            init: data.into(),
            parents: parents.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Declares a deterministic node; its value is computed from its parents
    /// at build time and recomputed whenever an upstream value changes.
    pub fn deterministic(
        mut self,
        name: &str,
        f: impl DeterministicFn + 'static,
        parents: &[&str],
    ) -> Self {
        self.decls.push(NodeDecl {
            name: name.to_string(),
            behavior: DeclBehavior::Deterministic { f: Box::new(f) },
            // Placeholder; replaced by the first evaluation during build.
            init: Value::F64(f64::NAN),
            parents: parents.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Declares a potential: an extra log-probability factor over its
    /// parents, carrying no value.
    pub fn potential(
        mut self,
        name: &str,
        f: impl PotentialFn + 'static,
        parents: &[&str],
    ) -> Self {
        self.decls.push(NodeDecl {
            name: name.to_string(),
            behavior: DeclBehavior::Potential { f: Box::new(f) },
            init: Value::F64(0.0),
            parents: parents.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Validates the declarations, wires the graph, computes generations and
    /// Markov blankets, and evaluates every deterministic node once.
    pub fn build(self) -> Result<Model, ModelError> {
        let mut by_name: HashMap<String, NodeId> = HashMap::new();
        for (i, decl) in self.decls.iter().enumerate() {
            if by_name
                .insert(decl.name.clone(), NodeId(i as u32))
                .is_some()
            {
                return Err(ModelError::DuplicateName(decl.name.clone()));
            }
        }

        let mut nodes: Vec<Node> = Vec::with_capacity(self.decls.len());
        for decl in self.decls {
            let mut parents = Vec::with_capacity(decl.parents.len());
            for pname in &decl.parents {
                let pid = by_name
                    .get(pname)
                    .copied()
                    .ok_or_else(|| ModelError::UnknownNode(pname.clone()))?;
                parents.push(pid);
            }
            let behavior = match decl.behavior {
                DeclBehavior::Stochastic { dist, observed } => {
                    NodeBehavior::Stochastic { dist, observed }
                }
                DeclBehavior::Deterministic { f } => NodeBehavior::Deterministic { f },
                DeclBehavior::Potential { f } => NodeBehavior::Potential { f },
            };
            nodes.push(Node {
                name: decl.name,
                value: decl.init,
                parents,
                children: Vec::new(),
                behavior,
            });
        }

        // Child links from parent links.
        for i in 0..nodes.len() {
            let id = NodeId(i as u32);
            let parents = nodes[i].parents.clone();
            for pid in parents {
                nodes[pid.index()].children.push(id);
            }
        }

        let (generations, gen_of) = compute_generations(&nodes)?;

        let mut free_stochastics = Vec::new();
        let mut observed = Vec::new();
        let mut deterministics = Vec::new();
        let mut potentials = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            let id = NodeId(i as u32);
            match node.behavior {
                NodeBehavior::Stochastic { observed: true, .. } => observed.push(id),
                NodeBehavior::Stochastic { .. } => free_stochastics.push(id),
                NodeBehavior::Deterministic { .. } => deterministics.push(id),
                NodeBehavior::Potential { .. } => potentials.push(id),
            }
        }

        let blankets = free_stochastics
            .iter()
            .map(|&id| (id, compute_blanket(&nodes, &gen_of, id)))
            .collect();

        let mut model = Model {
            nodes,
            by_name,
            free_stochastics,
            observed,
            deterministics,
            potentials,
            generations,
            blankets,
            gen_of,
        };

        // Initial pass so deterministic values are consistent with their
        // parents before any sampling happens.
        for gen in 0..model.generations.len() {
            for id in model.generations[gen].clone() {
                if model.nodes[id.index()].kind() == NodeKind::Deterministic {
                    model.recompute_deterministic(id);
                }
            }
        }

        Ok(model)
    }
}

/// Topological layering by repeated extraction: a generation is the set of
/// still-unresolved nodes whose parents are all resolved. No progress while
/// nodes remain means a cycle.
fn compute_generations(nodes: &[Node]) -> Result<(Vec<Vec<NodeId>>, Vec<usize>), ModelError> {
    let n = nodes.len();
    let mut resolved = vec![false; n];
    let mut gen_of = vec![0usize; n];
    let mut generations: Vec<Vec<NodeId>> = Vec::new();
    let mut remaining = n;

    while remaining > 0 {
        let mut layer = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            if !resolved[i] && node.parents.iter().all(|p| resolved[p.index()]) {
                layer.push(NodeId(i as u32));
            }
        }
        if layer.is_empty() {
            let stuck = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !resolved[*i])
                .map(|(_, node)| node.name.clone())
                .collect();
            return Err(ModelError::CyclicGraph(stuck));
        }
        for &id in &layer {
            resolved[id.index()] = true;
            gen_of[id.index()] = generations.len();
        }
        remaining -= layer.len();
        generations.push(layer);
    }
    Ok((generations, gen_of))
}

/// Walks the deterministic closure below `id`. Propagation stops at
/// stochastic and potential nodes: their values do not change when `id`
/// moves, only their log-probabilities do.
fn compute_blanket(nodes: &[Node], gen_of: &[usize], id: NodeId) -> Blanket {
    let mut det_updates: Vec<NodeId> = Vec::new();
    let mut factors: HashSet<NodeId> = HashSet::new();
    factors.insert(id);

    let mut stack = vec![id];
    let mut visited: HashSet<NodeId> = HashSet::new();
    while let Some(current) = stack.pop() {
        for &child in &nodes[current.index()].children {
            match nodes[child.index()].kind() {
                NodeKind::Deterministic => {
                    if visited.insert(child) {
                        det_updates.push(child);
                        stack.push(child);
                    }
                }
                NodeKind::Stochastic | NodeKind::Potential => {
                    factors.insert(child);
                }
            }
        }
    }

    det_updates.sort_by_key(|d| (gen_of[d.index()], *d));
    let mut factors: Vec<NodeId> = factors.into_iter().collect();
    factors.sort();
    Blanket {
        det_updates,
        factors,
    }
}

impl Model {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Unobserved stochastic nodes, in declaration order.
    pub fn free_stochastics(&self) -> &[NodeId] {
        &self.free_stochastics
    }

    /// Observed stochastic nodes (fixed data).
    pub fn observed_nodes(&self) -> &[NodeId] {
        &self.observed
    }

    pub fn deterministics(&self) -> &[NodeId] {
        &self.deterministics
    }

    pub fn potentials(&self) -> &[NodeId] {
        &self.potentials
    }

    /// Topological layers; every node's parents live in an earlier layer.
    pub fn generations(&self) -> &[Vec<NodeId>] {
        &self.generations
    }

    /// Immutable snapshot of every value-carrying node, name → value.
    pub fn value(&self) -> BTreeMap<String, Value> {
        self.nodes
            .iter()
            .filter(|node| node.kind() != NodeKind::Potential)
            .map(|node| (node.name.clone(), node.value.clone()))
            .collect()
    }

    pub(crate) fn set_value(&mut self, id: NodeId, value: Value) {
        self.nodes[id.index()].value = value;
    }

    pub(crate) fn blanket(&self, id: NodeId) -> &Blanket {
        &self.blankets[&id]
    }

    fn parent_values(&self, id: NodeId) -> Vec<&Value> {
        self.nodes[id.index()]
            .parents
            .iter()
            .map(|p| &self.nodes[p.index()].value)
            .collect()
    }

    /// Log-probability contribution of one node: its distribution's logp for
    /// stochastics, the potential term for potentials, zero otherwise. NaN
    /// signals an undefined value and is surfaced by callers.
    pub fn node_logp(&self, id: NodeId) -> f64 {
        let node = &self.nodes[id.index()];
        let parents = self.parent_values(id);
        match &node.behavior {
            NodeBehavior::Stochastic { dist, .. } => dist.logp(&node.value, &parents),
            NodeBehavior::Potential { f } => f.logp(&parents),
            NodeBehavior::Deterministic { .. } => 0.0,
        }
    }

    /// Joint log-probability of all stochastic and potential factors.
    pub fn logp(&self) -> Result<f64, ModelError> {
        let mut total = 0.0;
        for (i, node) in self.nodes.iter().enumerate() {
            if matches!(node.kind(), NodeKind::Stochastic | NodeKind::Potential) {
                let lp = self.node_logp(NodeId(i as u32));
                if lp.is_nan() {
                    return Err(ModelError::UndefinedLogp(node.name.clone()));
                }
                total += lp;
            }
        }
        Ok(total)
    }

    /// `-2 · Σ logp(observed)`, the deviance traced at every tally.
    pub fn deviance(&self) -> f64 {
        -2.0 * self
            .observed
            .iter()
            .map(|&id| self.node_logp(id))
            .sum::<f64>()
    }

    /// Sum of log-probability factors in `id`'s Markov blanket, the quantity
    /// Metropolis acceptance compares before and after a proposal.
    pub(crate) fn blanket_logp(&self, id: NodeId) -> f64 {
        self.blankets[&id]
            .factors
            .iter()
            .map(|&f| self.node_logp(f))
            .sum()
    }

    pub(crate) fn recompute_deterministic(&mut self, id: NodeId) {
        let value = {
            let node = &self.nodes[id.index()];
            let parents: Vec<&Value> = node
                .parents
                .iter()
                .map(|p| &self.nodes[p.index()].value)
                .collect();
            match &node.behavior {
                NodeBehavior::Deterministic { f } => f.eval(&parents),
                _ => return,
            }
        };
        self.nodes[id.index()].value = value;
    }

    /// Refreshes the deterministic closure below `id`, in generation order.
    pub(crate) fn refresh_blanket(&mut self, id: NodeId) {
        let updates = self.blankets[&id].det_updates.clone();
        for det in updates {
            self.recompute_deterministic(det);
        }
    }

    /// Replaces every unobserved stochastic value by a draw from its own
    /// distribution, walking generations so parents are redrawn before the
    /// nodes that depend on them. Deterministic nodes are recomputed along
    /// the way.
    pub fn draw_from_prior(&mut self, rng: &mut SmallRng) -> Result<(), ModelError> {
        for gen in 0..self.generations.len() {
            for id in self.generations[gen].clone() {
                let node = &self.nodes[id.index()];
                match &node.behavior {
                    NodeBehavior::Stochastic {
                        dist,
                        observed: false,
                    } => {
                        let parents: Vec<&Value> = node
                            .parents
                            .iter()
                            .map(|p| &self.nodes[p.index()].value)
                            .collect();
                        let drawn = dist
                            .draw(&node.value, &parents, rng)
                            .ok_or_else(|| ModelError::NotRandom(node.name.clone()))?;
                        self.nodes[id.index()].value = drawn;
                    }
                    NodeBehavior::Deterministic { .. } => {
                        self.recompute_deterministic(id);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub(crate) fn gen_of(&self, id: NodeId) -> usize {
        self.gen_of[id.index()]
    }

    /// Draws a replacement value for a stochastic node from its own
    /// distribution, or `None` if the node cannot draw. Used by
    /// prior-proposal step methods.
    pub(crate) fn draw_node(&self, id: NodeId, rng: &mut SmallRng) -> Option<Value> {
        let node = &self.nodes[id.index()];
        match &node.behavior {
            NodeBehavior::Stochastic { dist, .. } => {
                let parents = self.parent_values(id);
                dist.draw(&node.value, &parents, rng)
            }
            _ => None,
        }
    }

    /// Log-probability a stochastic node's own distribution assigns to a
    /// hypothetical value, without mutating the node. Used for Hastings
    /// corrections of prior proposals.
    pub(crate) fn node_dist_logp(&self, id: NodeId, value: &Value) -> f64 {
        let node = &self.nodes[id.index()];
        match &node.behavior {
            NodeBehavior::Stochastic { dist, .. } => {
                let parents = self.parent_values(id);
                dist.logp(value, &parents)
            }
            _ => f64::NAN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{CustomDist, NormalDist, Param, UniformDist};
    use rand::SeedableRng;

    fn flat_logp(value: &Value, _: &[&Value]) -> f64 {
        match value {
            Value::F64(_) => 0.0,
            _ => f64::NAN,
        }
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = ModelBuilder::new()
            .stochastic("x", CustomDist::new(flat_logp), 0.0, &[])
            .stochastic("x", CustomDist::new(flat_logp), 0.0, &[])
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::DuplicateName(name) if name == "x"));
    }

    #[test]
    fn unknown_parent_rejected() {
        let err = ModelBuilder::new()
            .stochastic("x", CustomDist::new(flat_logp), 0.0, &["ghost"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownNode(name) if name == "ghost"));
    }

    #[test]
    fn cycle_detected() {
        let err = ModelBuilder::new()
            .stochastic("a", CustomDist::new(flat_logp), 0.0, &["b"])
            .stochastic("b", CustomDist::new(flat_logp), 0.0, &["a"])
            .build()
            .unwrap_err();
        match err {
            ModelError::CyclicGraph(names) => {
                assert_eq!(names.len(), 2);
                assert!(names.contains(&"a".to_string()));
            }
            other => panic!("expected CyclicGraph, got {other:?}"),
        }
    }

    #[test]
    fn generations_respect_dependencies() {
        let model = ModelBuilder::new()
            .stochastic("mu", NormalDist::new(0.0.into(), 1.0.into()), 0.0, &[])
            .deterministic(
                "double",
                |parents: &[&Value]| Value::F64(2.0 * parents[0].as_f64().unwrap()),
                &["mu"],
            )
            .observed(
                "y",
                NormalDist::new(Param::Parent(0), Param::Const(1.0)),
                1.0,
                &["double"],
            )
            .build()
            .unwrap();

        let mu = model.node_id("mu").unwrap();
        let double = model.node_id("double").unwrap();
        let y = model.node_id("y").unwrap();
        assert!(model.gen_of(mu) < model.gen_of(double));
        assert!(model.gen_of(double) < model.gen_of(y));

        // Deterministic node evaluated during build.
        assert_eq!(model.node(double).value(), &Value::F64(0.0));
    }

    #[test]
    fn blanket_reaches_through_deterministics() {
        let model = ModelBuilder::new()
            .stochastic("mu", NormalDist::new(0.0.into(), 1.0.into()), 0.5, &[])
            .deterministic(
                "link",
                |parents: &[&Value]| Value::F64(parents[0].as_f64().unwrap() + 1.0),
                &["mu"],
            )
            .observed(
                "y",
                NormalDist::new(Param::Parent(0), Param::Const(1.0)),
                1.5,
                &["link"],
            )
            .build()
            .unwrap();

        let mu = model.node_id("mu").unwrap();
        let blanket = model.blanket(mu);
        assert_eq!(blanket.det_updates, vec![model.node_id("link").unwrap()]);
        assert!(blanket.factors.contains(&model.node_id("y").unwrap()));
        assert!(blanket.factors.contains(&mu));

        // With mu = 0.5 the link is 1.5 and y sits exactly on its mean.
        let expected = NormalDist::new(0.0.into(), 1.0.into()).logp(&Value::F64(0.5), &[])
            + NormalDist::new(0.0.into(), 1.0.into()).logp(&Value::F64(0.0), &[]);
        assert!((model.blanket_logp(mu) - expected).abs() < 1e-12);
    }

    #[test]
    fn value_snapshot_does_not_alias() {
        let model = ModelBuilder::new()
            .stochastic("x", NormalDist::new(0.0.into(), 1.0.into()), 1.25, &[])
            .build()
            .unwrap();
        let snap = model.value();
        assert_eq!(snap["x"], Value::F64(1.25));
        // Snapshot holds clones; the model is untouched by dropping it.
        drop(snap);
        assert_eq!(
            model.node(model.node_id("x").unwrap()).value(),
            &Value::F64(1.25)
        );
    }

    #[test]
    fn draw_from_prior_requires_random_nodes() {
        let mut model = ModelBuilder::new()
            .stochastic("x", CustomDist::new(flat_logp), 0.0, &[])
            .build()
            .unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let err = model.draw_from_prior(&mut rng).unwrap_err();
        assert!(matches!(err, ModelError::NotRandom(name) if name == "x"));
    }

    #[test]
    fn draw_from_prior_refreshes_deterministics() {
        let mut model = ModelBuilder::new()
            .stochastic("u", UniformDist::new(10.0.into(), 20.0.into()), 15.0, &[])
            .deterministic(
                "shift",
                |parents: &[&Value]| Value::F64(parents[0].as_f64().unwrap() - 10.0),
                &["u"],
            )
            .build()
            .unwrap();
        let mut rng = SmallRng::seed_from_u64(99);
        model.draw_from_prior(&mut rng).unwrap();
        let u = model
            .node(model.node_id("u").unwrap())
            .value()
            .as_f64()
            .unwrap();
        let shift = model
            .node(model.node_id("shift").unwrap())
            .value()
            .as_f64()
            .unwrap();
        assert!((10.0..20.0).contains(&u));
        assert!((shift - (u - 10.0)).abs() < 1e-12);
    }

    #[test]
    fn observed_nodes_enter_deviance() {
        let model = ModelBuilder::new()
            .stochastic("mu", NormalDist::new(0.0.into(), 1.0.into()), 0.0, &[])
            .observed(
                "y",
                NormalDist::new(Param::Parent(0), Param::Const(1.0)),
                0.0,
                &["mu"],
            )
            .build()
            .unwrap();
        let y = model.node_id("y").unwrap();
        let expected = -2.0 * model.node_logp(y);
        assert!((model.deviance() - expected).abs() < 1e-12);
    }
}
