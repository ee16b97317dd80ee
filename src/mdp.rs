use crate::error::Result;
use crate::policy::{Policy, ValueFunction};

/// A finite Markov decision process with a known model.
///
/// States are linearized indices in `0..num_states()`. Actions are signed
/// integers whose meaning is up to the model.
pub trait Mdp {
    fn num_states(&self) -> usize;

    /// Feasible actions for `state`, in the order the improver scans them.
    fn actions(&self, state: usize) -> Vec<i32>;

    fn is_feasible(&self, state: usize, action: i32) -> bool;

    /// One-step lookahead `Σ P(s'|s,a) · (R(s,a,s') + γ·V(s'))`.
    ///
    /// Returns `DpError::InfeasibleAction` instead of clamping the action.
    fn expected_return(
        &self, state: usize, action: i32, value: &ValueFunction, gamma: f64,
    ) -> Result<f64>;

    /// Policy that policy iteration starts from. All zeros by convention.
    fn initial_policy(&self) -> Policy {
        Policy::zeros(self.num_states())
    }
}
