//! Node values and the arena-addressed variable nodes a model is made of.
//!
//! Nodes reference each other through [`NodeId`] indices into the owning
//! model's arena rather than through pointers, so parent/child links can be
//! many-to-many without ownership cycles.

use ndarray::Array1;

use crate::distributions::{DeterministicFn, Distribution, PotentialFn};

/// A unique identifier for a node within one model's arena.
///
/// Implements `Ord` for stable, deterministic iteration order.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// The kind of a variable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A random quantity with a distribution.
    Stochastic,
    /// A quantity recomputed from its parents.
    Deterministic,
    /// A log-probability term over its parents, carrying no value of its own.
    Potential,
}

/// The current value of a node: a scalar or a fixed-shape 1-D array of
/// floats, integers, or booleans.
///
/// `Clone` is a deep copy, so keeping a clone and writing it back restores a
/// value bit-for-bit. That property is what step methods rely on when a
/// proposal is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    F64(f64),
    I64(i64),
    Bool(bool),
    ArrF64(Array1<f64>),
    ArrI64(Array1<i64>),
    ArrBool(Array1<bool>),
}

impl Value {
    /// Number of scalar elements in the value.
    pub fn len(&self) -> usize {
        match self {
            Value::F64(_) | Value::I64(_) | Value::Bool(_) => 1,
            Value::ArrF64(a) => a.len(),
            Value::ArrI64(a) => a.len(),
            Value::ArrBool(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for `F64` and `ArrF64`.
    pub fn is_float(&self) -> bool {
        matches!(self, Value::F64(_) | Value::ArrF64(_))
    }

    /// True for `I64` and `ArrI64`.
    pub fn is_integer(&self) -> bool {
        matches!(self, Value::I64(_) | Value::ArrI64(_))
    }

    /// True for `Bool` and `ArrBool`.
    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::ArrBool(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Value::ArrF64(_) | Value::ArrI64(_) | Value::ArrBool(_)
        )
    }

    /// The scalar float, if this is a `F64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(x) => Some(*x),
            _ => None,
        }
    }

    /// The scalar integer, if this is an `I64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(x) => Some(*x),
            _ => None,
        }
    }

    /// The scalar boolean, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Every element converted to `f64`, in storage order. Booleans map to
    /// 0.0/1.0. Used for tallying and for joint step methods that operate on
    /// a flattened concatenation of node values.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Value::F64(x) => vec![*x],
            Value::I64(x) => vec![*x as f64],
            Value::Bool(b) => vec![*b as u8 as f64],
            Value::ArrF64(a) => a.to_vec(),
            Value::ArrI64(a) => a.iter().map(|&x| x as f64).collect(),
            Value::ArrBool(a) => a.iter().map(|&b| b as u8 as f64).collect(),
        }
    }

    /// Rebuilds a value of the same shape and type from a flat float slice.
    /// Only defined for float-valued nodes; joint float updates use it to
    /// write proposals back.
    pub(crate) fn from_f64_slice_like(&self, flat: &[f64]) -> Option<Value> {
        match self {
            Value::F64(_) => Some(Value::F64(flat[0])),
            Value::ArrF64(a) if flat.len() == a.len() => {
                Some(Value::ArrF64(Array1::from_vec(flat.to_vec())))
            }
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::F64(x)
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Value::I64(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Array1<f64>> for Value {
    fn from(a: Array1<f64>) -> Self {
        Value::ArrF64(a)
    }
}

impl From<Array1<i64>> for Value {
    fn from(a: Array1<i64>) -> Self {
        Value::ArrI64(a)
    }
}

impl From<Array1<bool>> for Value {
    fn from(a: Array1<bool>) -> Self {
        Value::ArrBool(a)
    }
}

/// What a node is: the distribution, function, or potential behind it.
pub enum NodeBehavior {
    Stochastic {
        dist: Box<dyn Distribution>,
        /// Observed nodes hold fixed data and are never updated by a step
        /// method.
        observed: bool,
    },
    Deterministic {
        f: Box<dyn DeterministicFn>,
    },
    Potential {
        f: Box<dyn PotentialFn>,
    },
}

/// A variable node in the model graph.
///
/// Lives inside exactly one model's arena; step methods and the generation
/// list refer to it by [`NodeId`].
pub struct Node {
    pub(crate) name: String,
    pub(crate) value: Value,
    pub(crate) parents: Vec<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) behavior: NodeBehavior,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn kind(&self) -> NodeKind {
        match self.behavior {
            NodeBehavior::Stochastic { .. } => NodeKind::Stochastic,
            NodeBehavior::Deterministic { .. } => NodeKind::Deterministic,
            NodeBehavior::Potential { .. } => NodeKind::Potential,
        }
    }

    /// True for stochastic nodes holding fixed data.
    pub fn observed(&self) -> bool {
        matches!(
            self.behavior,
            NodeBehavior::Stochastic { observed: true, .. }
        )
    }

    /// True for stochastic nodes a step method may update.
    pub fn is_free_stochastic(&self) -> bool {
        matches!(
            self.behavior,
            NodeBehavior::Stochastic {
                observed: false,
                ..
            }
        )
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("value", &self.value)
            .field("parents", &self.parents)
            .field("children", &self.children)
            .finish()
    }
}
