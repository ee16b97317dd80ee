use approx::relative_eq;
use log::{debug, info, warn};
use ndarray::Zip;
use serde::Deserialize;

use crate::error::{DpError, Result};
use crate::mdp::Mdp;
use crate::policy::{Policy, ValueFunction};


/// Decides between two actions whose lookahead gains are tied.
pub trait TieBreak {
    /// Whether `candidate` should replace the current best `incumbent`.
    fn prefer(&self, candidate: i32, incumbent: i32) -> bool;
}

/// Keep whichever tied action was scanned first.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstEncountered;

impl TieBreak for FirstEncountered {
    fn prefer(&self, _candidate: i32, _incumbent: i32) -> bool {
        false
    }
}

/// Prefer the tied action with the smaller magnitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct Conservative;

impl TieBreak for Conservative {
    fn prefer(&self, candidate: i32, incumbent: i32) -> bool {
        candidate.unsigned_abs() < incumbent.unsigned_abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakKind {
    #[default]
    FirstEncountered,
    Conservative,
}

impl TieBreakKind {
    pub fn strategy(&self) -> Box<dyn TieBreak> {
        match self {
            TieBreakKind::FirstEncountered => Box::new(FirstEncountered),
            TieBreakKind::Conservative => Box::new(Conservative),
        }
    }
}


/// Receives progress from the solver loops.
pub trait Observer {
    /// Called after every full sweep over the state space.
    fn on_sweep(&mut self, _sweep: usize, _delta: f64) {}

    /// Called after every improvement step of policy iteration.
    fn on_improvement(&mut self, _iteration: usize, _changed_states: usize) {}
}

/// Forwards progress to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_sweep(&mut self, sweep: usize, delta: f64) {
        debug!("sweep {sweep}: delta {delta:.6}");
    }

    fn on_improvement(&mut self, iteration: usize, changed_states: usize) {
        info!("iteration {iteration}: {changed_states} states changed action");
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl Observer for Silent {}


/// Solver settings, read from the `[solver]` table of the config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Discount rate
    pub gamma: f64,
    /// Stop evaluating once no state value changes by this much in a sweep
    pub theta: f64,
    /// Sweeps before evaluation gives up and returns its best effort
    pub max_sweeps: usize,
    /// Policy iteration gives up after this many improvement steps
    pub max_iterations: usize,
    /// Relative difference below which two lookahead gains are tied
    pub tie_tolerance: f64,
    pub tie_break: TieBreakKind,
    /// Start each evaluation from the previous policy's value function
    pub warm_start: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            gamma: 0.9,
            theta: 1e-4,
            max_sweeps: 10_000,
            max_iterations: 100,
            tie_tolerance: 1e-9,
            tie_break: TieBreakKind::FirstEncountered,
            warm_start: false,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            return Err(DpError::InvalidDiscount(self.gamma));
        }
        if !(self.theta > 0.0 && self.theta.is_finite()) {
            return Err(DpError::InvalidThreshold { what: "theta", value: self.theta });
        }
        if !(self.tie_tolerance >= 0.0 && self.tie_tolerance.is_finite()) {
            return Err(DpError::InvalidThreshold {
                what: "tie_tolerance", value: self.tie_tolerance,
            });
        }
        if self.max_sweeps == 0 {
            return Err(DpError::InvalidThreshold { what: "max_sweeps", value: 0.0 });
        }
        if self.max_iterations == 0 {
            return Err(DpError::InvalidThreshold { what: "max_iterations", value: 0.0 });
        }
        Ok(())
    }
}


/// Result of evaluating a single policy.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub value: ValueFunction,
    pub sweeps: usize,
    /// Largest change in the final sweep
    pub delta: f64,
    pub converged: bool,
}

/// Result of policy iteration.
#[derive(Debug, Clone)]
pub struct PolicyIteration {
    /// Every policy visited, starting with the initial one. The last entry is
    /// the stable policy when `converged` is set.
    pub policies: Vec<Policy>,
    /// Value function of the last policy
    pub value: ValueFunction,
    pub converged: bool,
}

impl PolicyIteration {
    pub fn policy(&self) -> &Policy {
        &self.policies[self.policies.len() - 1]
    }
}


/// Dynamic programming solver over a model implementing [`Mdp`].
pub struct Solver<'m, M: Mdp + ?Sized> {
    mdp: &'m M,
    config: SolverConfig,
    tie_break: Box<dyn TieBreak>,
    observer: Box<dyn Observer>,
}

impl<'m, M: Mdp + ?Sized> Solver<'m, M> {
    pub fn new(mdp: &'m M, config: SolverConfig) -> Result<Self> {
        config.validate()?;
        let tie_break = config.tie_break.strategy();
        Ok(Solver { mdp, config, tie_break, observer: Box::new(LogObserver) })
    }

    pub fn with_tie_break(mut self, tie_break: impl TieBreak + 'static) -> Self {
        self.tie_break = Box::new(tie_break);
        self
    }

    pub fn with_observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    fn check_len(&self, found: usize) -> Result<()> {
        let expected = self.mdp.num_states();
        if found == expected {
            Ok(())
        } else {
            Err(DpError::PolicyShape { expected, found })
        }
    }

    /// Iterative policy evaluation.
    ///
    /// Every sweep computes all new values from the previous sweep's values.
    /// Running out of sweeps is logged and reported through
    /// [`Evaluation::converged`], not returned as an error.
    pub fn evaluate(
        &mut self, policy: &Policy, warm_start: Option<&ValueFunction>,
    ) -> Result<Evaluation> {
        self.check_len(policy.len())?;
        for (s, &a) in policy.actions.iter().enumerate() {
            if !self.mdp.is_feasible(s, a) {
                return Err(DpError::InfeasibleAction { state: s, action: a });
            }
        }
        let mut value = match warm_start {
            Some(v) => {
                self.check_len(v.len())?;
                v.clone()
            }
            None => ValueFunction::zeros(policy.len()),
        };

        let gamma = self.config.gamma;
        let mut delta = f64::INFINITY;
        for sweep in 1..=self.config.max_sweeps {
            let prev = value.clone();
            for (s, &a) in policy.actions.iter().enumerate() {
                value[s] = self.mdp.expected_return(s, a, &prev, gamma)?;
            }
            delta = sup_norm_diff(&value, &prev);
            self.observer.on_sweep(sweep, delta);
            if delta < self.config.theta {
                return Ok(Evaluation { value, sweeps: sweep, delta, converged: true });
            }
        }
        warn!(
            "policy evaluation did not converge after {} sweeps (delta {delta:.6})",
            self.config.max_sweeps
        );
        Ok(Evaluation { value, sweeps: self.config.max_sweeps, delta, converged: false })
    }

    /// Best feasible action in `state` and its lookahead gain.
    fn best_action(&self, state: usize, value: &ValueFunction) -> Result<(i32, f64)> {
        let gamma = self.config.gamma;
        let tolerance = self.config.tie_tolerance;
        let mut best: Option<(i32, f64)> = None;
        for action in self.mdp.actions(state) {
            let gain = self.mdp.expected_return(state, action, value, gamma)?;
            best = match best {
                None => Some((action, gain)),
                Some((incumbent, best_gain)) => {
                    if relative_eq!(gain, best_gain, epsilon = f64::EPSILON, max_relative = tolerance) {
                        if self.tie_break.prefer(action, incumbent) {
                            Some((action, gain))
                        } else {
                            best
                        }
                    } else if gain > best_gain {
                        Some((action, gain))
                    } else {
                        best
                    }
                }
            };
        }
        best.ok_or(DpError::NoFeasibleAction(state))
    }

    /// Greedy policy with respect to `value`.
    pub fn improve(&self, value: &ValueFunction) -> Result<Policy> {
        self.check_len(value.len())?;
        let actions = (0..self.mdp.num_states())
            .map(|s| self.best_action(s, value).map(|(a, _)| a))
            .collect::<Result<Vec<i32>>>()?;
        Ok(Policy::new(actions.into()))
    }

    /// Alternate evaluation and improvement until the improved policy equals
    /// the one it was computed from.
    pub fn run_policy_iteration(&mut self, initial_policy: Policy) -> Result<PolicyIteration> {
        let mut policies = vec![initial_policy];
        let mut warm: Option<ValueFunction> = None;
        for iteration in 1..=self.config.max_iterations {
            let current = &policies[policies.len() - 1];
            let evaluation = self.evaluate(current, warm.as_ref())?;
            let improved = self.improve(&evaluation.value)?;
            self.observer.on_improvement(iteration, improved.changed_states(current));
            if improved == *current {
                info!("policy stable after {iteration} iterations");
                return Ok(PolicyIteration { policies, value: evaluation.value, converged: true });
            }
            policies.push(improved);
            if self.config.warm_start {
                warm = Some(evaluation.value);
            }
        }
        warn!(
            "policy iteration stopped after {} iterations without a stable policy",
            self.config.max_iterations
        );
        let last = &policies[policies.len() - 1];
        let evaluation = self.evaluate(last, warm.as_ref())?;
        Ok(PolicyIteration { policies, value: evaluation.value, converged: false })
    }

    /// Value iteration from a zero value function.
    ///
    /// Returns the value function after every sweep; the last one is the
    /// estimate of the optimal value function.
    pub fn value_iteration(&mut self) -> Result<Vec<ValueFunction>> {
        let mut value = ValueFunction::zeros(self.mdp.num_states());
        let mut history = Vec::new();
        for sweep in 1..=self.config.max_sweeps {
            let prev = value.clone();
            for s in 0..value.len() {
                value[s] = self.best_action(s, &prev)?.1;
            }
            let delta = sup_norm_diff(&value, &prev);
            self.observer.on_sweep(sweep, delta);
            history.push(value.clone());
            if delta < self.config.theta {
                return Ok(history);
            }
        }
        warn!("value iteration did not converge after {} sweeps", self.config.max_sweeps);
        Ok(history)
    }
}

fn sup_norm_diff(a: &ValueFunction, b: &ValueFunction) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc: f64, &x, &y| acc.max((x - y).abs()))
}


#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::cars::{CarRental, LinearMoveCost, Lot};
    use crate::gambler::Gambler;
    use approx::assert_abs_diff_eq;
    use test_case::test_case;

    /// One state that loops back to itself, paying a fixed reward per action.
    struct OneState {
        rewards: Vec<(i32, f64)>,
    }

    impl Mdp for OneState {
        fn num_states(&self) -> usize {
            1
        }

        fn actions(&self, _state: usize) -> Vec<i32> {
            self.rewards.iter().map(|(a, _)| *a).collect()
        }

        fn is_feasible(&self, state: usize, action: i32) -> bool {
            state == 0 && self.rewards.iter().any(|(a, _)| *a == action)
        }

        fn expected_return(
            &self, state: usize, action: i32, value: &ValueFunction, gamma: f64,
        ) -> Result<f64> {
            self.rewards.iter()
                .find(|(a, _)| *a == action)
                .map(|(_, r)| r + gamma * value[0])
                .ok_or(DpError::InfeasibleAction { state, action })
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        deltas: Rc<RefCell<Vec<f64>>>,
        changes: Rc<RefCell<Vec<usize>>>,
    }

    impl Observer for Recorder {
        fn on_sweep(&mut self, _sweep: usize, delta: f64) {
            self.deltas.borrow_mut().push(delta);
        }

        fn on_improvement(&mut self, _iteration: usize, changed_states: usize) {
            self.changes.borrow_mut().push(changed_states);
        }
    }

    fn small_rental() -> CarRental {
        CarRental::new(
            [Lot::new(5, 3.0, 3.0), Lot::new(5, 4.0, 2.0)],
            2, 10.0, 25,
            Box::new(LinearMoveCost { per_car: 2.0 }),
        ).unwrap()
    }

    fn tight() -> SolverConfig {
        SolverConfig { gamma: 0.9, theta: 1e-6, ..SolverConfig::default() }
    }

    fn gambler_config() -> SolverConfig {
        SolverConfig {
            gamma: 1.0,
            theta: 1e-4,
            tie_break: TieBreakKind::Conservative,
            ..SolverConfig::default()
        }
    }

    #[test_case(0.0; "Zero discount")]
    #[test_case(-0.5; "Negative discount")]
    #[test_case(1.5; "Discount above one")]
    fn reject_invalid_discount(gamma: f64) {
        let config = SolverConfig { gamma, ..SolverConfig::default() };
        assert!(matches!(config.validate(), Err(DpError::InvalidDiscount(_))));
    }

    #[test]
    fn reject_invalid_threshold() {
        let config = SolverConfig { theta: 0.0, ..SolverConfig::default() };
        assert!(matches!(
            config.validate(),
            Err(DpError::InvalidThreshold { what: "theta", .. })
        ));
    }

    #[test]
    fn evaluate_single_state_loop() {
        // Arrange
        let mdp = OneState { rewards: vec![(0, 1.0)] };
        let config = SolverConfig { gamma: 0.5, theta: 1e-9, ..SolverConfig::default() };
        let mut solver = Solver::new(&mdp, config).unwrap().with_observer(Silent);
        // Act
        let evaluation = solver.evaluate(&Policy::zeros(1), None).unwrap();
        // Assert
        assert!(evaluation.converged);
        assert!(evaluation.delta < 1e-9);
        assert_abs_diff_eq!(evaluation.value[0], 2.0, epsilon = 1e-8);
    }

    #[test]
    fn evaluation_reports_non_convergence() {
        // Arrange
        let mdp = OneState { rewards: vec![(0, 1.0)] };
        let config = SolverConfig { gamma: 0.99, max_sweeps: 3, ..SolverConfig::default() };
        let recorder = Recorder::default();
        let mut solver = Solver::new(&mdp, config).unwrap().with_observer(recorder.clone());
        // Act
        let evaluation = solver.evaluate(&Policy::zeros(1), None).unwrap();
        // Assert
        assert!(!evaluation.converged);
        assert_eq!(evaluation.sweeps, 3);
        assert_eq!(recorder.deltas.borrow().len(), 3);
        assert!(evaluation.value[0] > 0.0);
    }

    #[test]
    fn evaluation_rejects_infeasible_policy() {
        let cars = small_rental();
        let mut solver = Solver::new(&cars, tight()).unwrap().with_observer(Silent);
        // Moving a car out of an empty lot 1 at state (0, 0).
        let mut policy = Policy::zeros(cars.num_states());
        policy.actions[0] = 1;
        let result = solver.evaluate(&policy, None);
        assert!(matches!(result, Err(DpError::InfeasibleAction { state: 0, action: 1 })));
    }

    #[test]
    fn evaluation_rejects_wrong_policy_length() {
        let cars = small_rental();
        let mut solver = Solver::new(&cars, tight()).unwrap().with_observer(Silent);
        let result = solver.evaluate(&Policy::zeros(5), None);
        assert!(matches!(result, Err(DpError::PolicyShape { expected: 36, found: 5 })));
    }

    #[test]
    fn evaluation_deltas_shrink() {
        // Arrange
        let cars = small_rental();
        let recorder = Recorder::default();
        let mut solver = Solver::new(&cars, tight()).unwrap().with_observer(recorder.clone());
        // Act
        let evaluation = solver.evaluate(&cars.initial_policy(), None).unwrap();
        // Assert
        let deltas = recorder.deltas.borrow();
        assert!(evaluation.converged);
        assert_eq!(deltas.len(), evaluation.sweeps);
        for pair in deltas.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12);
        }
    }

    #[test]
    fn first_encountered_tie_break() {
        let mdp = OneState { rewards: vec![(2, 1.0), (-1, 1.0), (1, 0.5)] };
        let solver = Solver::new(&mdp, SolverConfig::default()).unwrap();
        let policy = solver.improve(&ValueFunction::zeros(1)).unwrap();
        assert_eq!(policy.action(0), 2);
    }

    #[test]
    fn conservative_tie_break() {
        let mdp = OneState { rewards: vec![(2, 1.0), (-1, 1.0), (1, 0.5)] };
        let solver = Solver::new(&mdp, SolverConfig::default())
            .unwrap()
            .with_tie_break(Conservative);
        let policy = solver.improve(&ValueFunction::zeros(1)).unwrap();
        assert_eq!(policy.action(0), -1);
    }

    #[test]
    fn clear_winner_ignores_tie_break() {
        let mdp = OneState { rewards: vec![(0, 1.0), (3, 1.5)] };
        let solver = Solver::new(&mdp, SolverConfig::default())
            .unwrap()
            .with_tie_break(Conservative);
        let policy = solver.improve(&ValueFunction::zeros(1)).unwrap();
        assert_eq!(policy.action(0), 3);
    }

    #[test]
    fn improve_chooses_only_feasible_actions() {
        // Arrange
        let cars = small_rental();
        let solver = Solver::new(&cars, tight()).unwrap();
        let value = ValueFunction::from_shape_fn(cars.num_states(), |s| s as f64);
        // Act
        let policy = solver.improve(&value).unwrap();
        // Assert
        for (s, &a) in policy.actions.iter().enumerate() {
            assert!(cars.is_feasible(s, a));
        }
    }

    #[test]
    fn policy_iteration_terminates_on_small_rental() {
        // Arrange
        let cars = small_rental();
        let recorder = Recorder::default();
        let mut solver = Solver::new(&cars, tight()).unwrap().with_observer(recorder.clone());
        // Act
        let result = solver.run_policy_iteration(cars.initial_policy()).unwrap();
        // Assert
        assert!(result.converged);
        assert!(result.policies.len() < 20);
        assert_eq!(result.policies[0], Policy::zeros(36));
        assert_eq!(recorder.changes.borrow().last(), Some(&0));
        for pair in result.policies.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn policy_iteration_stops_at_iteration_cap() {
        // Arrange
        let cars = small_rental();
        let config = SolverConfig { max_iterations: 1, ..tight() };
        let recorder = Recorder::default();
        let mut solver = Solver::new(&cars, config).unwrap().with_observer(recorder.clone());
        // Act
        let result = solver.run_policy_iteration(cars.initial_policy()).unwrap();
        // Assert
        assert!(!result.converged);
        assert_eq!(result.policies.len(), 2);
        assert_eq!(result.value.len(), 36);
        assert_eq!(recorder.changes.borrow().len(), 1);
        assert_ne!(result.policies[0], result.policies[1]);
    }

    #[test]
    fn stable_policy_is_a_fixed_point() {
        // Arrange
        let cars = small_rental();
        let mut solver = Solver::new(&cars, tight()).unwrap().with_observer(Silent);
        let result = solver.run_policy_iteration(cars.initial_policy()).unwrap();
        // Act
        let improved = solver.improve(&result.value).unwrap();
        // Assert
        assert_eq!(&improved, result.policy());
    }

    #[test]
    fn reevaluating_converged_value_is_idempotent() {
        // Arrange
        let cars = small_rental();
        let config = SolverConfig { theta: 1e-3, ..tight() };
        let mut solver = Solver::new(&cars, config).unwrap().with_observer(Silent);
        let policy = cars.initial_policy();
        let first = solver.evaluate(&policy, None).unwrap();
        // Act
        let second = solver.evaluate(&policy, Some(&first.value)).unwrap();
        // Assert
        assert_eq!(second.sweeps, 1);
        for (v1, v2) in first.value.iter().zip(second.value.iter()) {
            assert!((v1 - v2).abs() < 1e-3);
        }
    }

    #[test]
    fn improvement_never_decreases_value() {
        // Arrange
        let cars = small_rental();
        let mut solver = Solver::new(&cars, tight()).unwrap().with_observer(Silent);
        let before = solver.evaluate(&cars.initial_policy(), None).unwrap();
        // Act
        let improved = solver.improve(&before.value).unwrap();
        let after = solver.evaluate(&improved, None).unwrap();
        // Assert
        for (v0, v1) in before.value.iter().zip(after.value.iter()) {
            assert!(*v1 >= v0 - 1e-4);
        }
    }

    #[test]
    fn warm_start_reaches_same_value() {
        // Arrange
        let cars = small_rental();
        let warm_config = SolverConfig { warm_start: true, ..tight() };
        let mut cold = Solver::new(&cars, tight()).unwrap().with_observer(Silent);
        let mut warm = Solver::new(&cars, warm_config).unwrap().with_observer(Silent);
        // Act
        let cold_result = cold.run_policy_iteration(cars.initial_policy()).unwrap();
        let warm_result = warm.run_policy_iteration(cars.initial_policy()).unwrap();
        // Assert
        assert!(warm_result.converged);
        assert_abs_diff_eq!(warm_result.value, cold_result.value, epsilon = 1e-2);
    }

    #[test]
    fn gambler_sinks_are_worthless() {
        // Arrange
        let gambler = Gambler::new(0.5, 100, 1.0).unwrap();
        let mut solver = Solver::new(&gambler, gambler_config()).unwrap().with_observer(Silent);
        // Act
        let history = solver.value_iteration().unwrap();
        // Assert
        let value = history.last().unwrap();
        assert_eq!(value[0], 0.0);
        assert_eq!(value[100], 0.0);
        assert_abs_diff_eq!(value[50], 0.5, epsilon = 0.05);
    }

    #[test_case(0.25, 50, 0.25; "Quarter odds at half capital")]
    #[test_case(0.4, 50, 0.4; "Textbook odds at half capital")]
    #[test_case(0.4, 25, 0.16; "Textbook odds at quarter capital")]
    #[test_case(0.4, 75, 0.64; "Textbook odds at three quarter capital")]
    fn gambler_reference_values(win_prob: f64, capital: usize, expected: f64) {
        // Arrange
        let gambler = Gambler::new(win_prob, 100, 1.0).unwrap();
        let mut solver = Solver::new(&gambler, gambler_config()).unwrap().with_observer(Silent);
        // Act
        let history = solver.value_iteration().unwrap();
        // Assert
        assert_abs_diff_eq!(history.last().unwrap()[capital], expected, epsilon = 0.05);
    }

    #[test]
    fn gambler_value_grows_with_capital() {
        // Arrange
        let gambler = Gambler::new(0.4, 100, 1.0).unwrap();
        let mut solver = Solver::new(&gambler, gambler_config()).unwrap().with_observer(Silent);
        // Act
        let history = solver.value_iteration().unwrap();
        // Assert
        let value = history.last().unwrap();
        assert!(history.len() > 1);
        for s in 0..99 {
            assert!(value[s + 1] >= value[s] - 1e-3);
        }
    }

    #[test]
    fn gambler_bets_everything_at_half_capital() {
        // Arrange
        let gambler = Gambler::new(0.4, 100, 1.0).unwrap();
        let mut solver = Solver::new(&gambler, gambler_config()).unwrap().with_observer(Silent);
        let history = solver.value_iteration().unwrap();
        // Act
        let policy = solver.improve(history.last().unwrap()).unwrap();
        // Assert
        assert_eq!(policy.action(0), 0);
        assert_eq!(policy.action(100), 0);
        assert_eq!(policy.action(50), 50);
        for (s, &a) in policy.actions.iter().enumerate() {
            assert!(gambler.is_feasible(s, a));
        }
    }
}
