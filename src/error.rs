//! Error types for model construction, sampling, and diagnostics.

use thiserror::Error;

/// Errors raised while building or evaluating a model graph.
///
/// Construction errors are fatal: `ModelBuilder::build` either returns a fully
/// wired model or one of these, never a partial model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The dependency graph among nodes contains a cycle. The payload lists
    /// the names of the nodes that could not be placed in any generation.
    #[error("cyclic dependency among nodes: {0:?}")]
    CyclicGraph(Vec<String>),

    /// Two nodes were declared with the same name.
    #[error("duplicate node name: {0}")]
    DuplicateName(String),

    /// A parent reference points at a name no node carries.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A prior draw was requested on a node whose distribution cannot
    /// generate random values.
    #[error("node {0} does not support drawing from its prior")]
    NotRandom(String),

    /// A node's log-probability evaluated to NaN for its current value.
    #[error("log-probability of node {0} is undefined for its current value")]
    UndefinedLogp(String),
}

/// Errors raised by a step method during one Markov transition.
#[derive(Debug, Error)]
pub enum StepError {
    /// A proposal produced a value for which some node's log-probability is
    /// mathematically undefined (NaN). The sampler halts on this; silently
    /// retrying would bias the stationary distribution.
    #[error("proposal for node {node} produced an undefined log-probability")]
    ProposalDomain { node: String },

    /// A step method was asked to update a node whose value type it cannot
    /// handle (e.g. `BinaryMetropolis` on a float node).
    #[error("step method {method} cannot update node {node}: {reason}")]
    IncompatibleNode {
        method: &'static str,
        node: String,
        reason: String,
    },

    /// No registered step method scored a positive competence for a node.
    #[error("no step method is competent for node {0}")]
    NoCompetentMethod(String),
}

/// Errors raised by trace storage.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A read referenced a quantity that was never tallied.
    #[error("unknown trace quantity: {0}")]
    UnknownQuantity(String),

    /// The stored series for a quantity does not have the expected length.
    #[error("trace length mismatch for {name}: expected {expected}, got {got}")]
    LengthMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// A scalar accessor was called on a non-scalar series, or values of
    /// mixed types were written under one name.
    #[error("trace quantity {0} is not convertible to f64")]
    NotNumeric(String),
}

/// Errors raised by the pure diagnostic functions.
#[derive(Debug, Error)]
pub enum DiagnosticsError {
    /// The trace is too short for the requested computation.
    #[error("insufficient samples: need at least {needed}, got {got}")]
    InsufficientSamples { needed: usize, got: usize },

    /// An iterative estimate failed to converge within its search bounds.
    #[error("estimate did not converge: {0}")]
    NonConvergentEstimate(String),

    /// A numeric configuration parameter is outside its valid range.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Umbrella error for the sampling loop.
#[derive(Debug, Error)]
pub enum McmcError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    /// The sampler is not in a state that allows the requested transition
    /// (e.g. `resume` on a chain that already finished).
    #[error("invalid sampler state: {0}")]
    InvalidState(String),
}
