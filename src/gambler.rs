use crate::error::{DpError, Result};
use crate::mdp::Mdp;
use crate::policy::{Policy, ValueFunction};

/// The gambler's problem.
///
/// A gambler with capital `s` stakes between 1 and `min(s, goal - s)` on a
/// coin flip that comes up heads with probability `win_prob`. Capital 0 and
/// `goal` are absorbing sinks worth nothing; the only reward is `goal_reward`
/// for a flip that lands exactly on the goal.
#[derive(Debug, Clone, PartialEq)]
pub struct Gambler {
    pub win_prob: f64,
    pub goal: usize,
    pub goal_reward: f64,
}

impl Gambler {
    pub fn new(win_prob: f64, goal: usize, goal_reward: f64) -> Result<Gambler> {
        if !(0.0..=1.0).contains(&win_prob) {
            return Err(DpError::InvalidProbability(win_prob));
        }
        if goal == 0 {
            return Err(DpError::InvalidBound("goal must be at least 1".into()));
        }
        if !goal_reward.is_finite() {
            return Err(DpError::InvalidBound(format!("goal_reward {goal_reward} is not finite")));
        }
        Ok(Gambler { win_prob, goal, goal_reward })
    }

    pub fn is_terminal(&self, capital: usize) -> bool {
        capital == 0 || capital >= self.goal
    }

    fn max_stake(&self, capital: usize) -> usize {
        capital.min(self.goal - capital)
    }

    /// Reward for moving from `capital` to `next`.
    pub fn reward(&self, capital: usize, next: usize) -> f64 {
        if !self.is_terminal(capital) && next == self.goal {
            self.goal_reward
        } else {
            0.0
        }
    }
}

impl Mdp for Gambler {
    fn num_states(&self) -> usize {
        self.goal + 1
    }

    fn actions(&self, state: usize) -> Vec<i32> {
        if state > self.goal {
            Vec::new()
        } else if self.is_terminal(state) {
            vec![0]
        } else {
            (1..=self.max_stake(state) as i32).collect()
        }
    }

    fn is_feasible(&self, state: usize, action: i32) -> bool {
        if state > self.goal {
            false
        } else if self.is_terminal(state) {
            action == 0
        } else {
            action >= 1 && action as usize <= self.max_stake(state)
        }
    }

    fn expected_return(
        &self, state: usize, action: i32, value: &ValueFunction, gamma: f64,
    ) -> Result<f64> {
        if !self.is_feasible(state, action) {
            return Err(DpError::InfeasibleAction { state, action });
        }
        if self.is_terminal(state) {
            return Ok(gamma * value[state]);
        }
        let stake = action as usize;
        let (win, lose) = (state + stake, state - stake);
        let p = self.win_prob;
        Ok(p * (self.reward(state, win) + gamma * value[win])
            + (1.0 - p) * (self.reward(state, lose) + gamma * value[lose]))
    }

    /// Smallest stake everywhere; a stake of zero is not a legal bet.
    fn initial_policy(&self) -> Policy {
        let actions = (0..=self.goal)
            .map(|s| if self.is_terminal(s) { 0 } else { 1 })
            .collect();
        Policy::new(actions)
    }
}
