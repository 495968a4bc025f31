//! # graph-mcmc
//!
//! A compact library for fitting probabilistic models by Markov Chain Monte
//! Carlo: a model is a graph of stochastic, deterministic, and potential
//! nodes; self-tuning step methods are assigned to each free stochastic by
//! competence; and a cooperative sampling loop records traces that the
//! convergence diagnostics consume.
//!
//! ```rust
//! use graph_mcmc::distributions::{NormalDist, Param};
//! use graph_mcmc::model::ModelBuilder;
//! use graph_mcmc::sampler::{Mcmc, SampleOptions};
//!
//! let model = ModelBuilder::new()
//!     .stochastic("mu", NormalDist::new(Param::Const(0.0), Param::Const(10.0)), 0.0, &[])
//!     .observed("y", NormalDist::new(Param::Parent(0), Param::Const(1.0)), 1.2, &["mu"])
//!     .build()
//!     .unwrap();
//!
//! let mut mcmc = Mcmc::new(model).set_seed(42);
//! mcmc.sample(SampleOptions::new(2000).burn(1000)).unwrap();
//! let mu = mcmc.trace().as_f64("mu").unwrap();
//! assert_eq!(mu.len(), 1000);
//! ```

pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod model;
pub mod node;
pub mod sampler;
pub mod steppers;
pub mod trace;
