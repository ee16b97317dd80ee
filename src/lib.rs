//! Dynamic programming solvers for Sutton & Barto's car rental and gambler
//! problems.

pub mod cars;
pub mod config;
pub mod error;
pub mod gambler;
pub mod mdp;
pub mod policy;
pub mod solver;

pub use error::{DpError, Result};
pub use mdp::Mdp;
pub use policy::{Policy, ValueFunction};
