//! Pump schedule optimisation
//!
//! - `nlp`: solver-agnostic nonlinear program and solver traits
//! - `solver`: augmented-Lagrangian backend
//! - `constraints`: operating limits and exact reachability of the storage model
//! - `mpc`: the tunnel problem and the receding-horizon engine

pub mod constraints;
pub mod mpc;
pub mod nlp;
pub mod solver;
pub mod types;

pub use constraints::*;
pub use mpc::*;
pub use nlp::*;
pub use solver::*;
pub use types::*;
