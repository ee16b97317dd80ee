use std::fmt;

use log::{debug, warn};
use ndarray::{s, Array2, Array3};
use serde::Deserialize;
use statrs::distribution::{Discrete, DiscreteCDF, Poisson};

use crate::error::{DpError, Result};
use crate::mdp::Mdp;
use crate::policy::ValueFunction;

/// Dropped Poisson tail mass above which construction logs a warning.
const TAIL_WARNING: f64 = 1e-6;

/// How each lot's count changes per unit of action. A positive action moves
/// cars from lot #1 to lot #2.
const MOVE_SIGN: [i32; 2] = [-1, 1];


/// One rental location.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Lot {
    /// Maximum number of cars that can be stored on the lot
    pub max_cars: usize,
    /// Expected number of cars requested each day
    pub rent_mean: f64,
    /// Expected number of cars returned each day
    pub return_mean: f64,
}

impl Lot {
    pub fn new(max_cars: usize, rent_mean: f64, return_mean: f64) -> Lot {
        Lot { max_cars, rent_mean, return_mean }
    }

    fn size(&self) -> usize {
        self.max_cars + 1
    }
}


/// Start-of-day inventory at both lots.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct State {
    pub cars: [usize; 2],
}

impl State {
    pub fn new(n1: usize, n2: usize) -> State {
        State { cars: [n1, n2] }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(n1: {}, n2: {})", self.cars[0], self.cars[1])
    }
}


/// Iterates over every state in row-major order, matching the linearized
/// state index.
pub struct StateIterator {
    n1: usize,
    n2: usize,
    max_n1: usize,
    max_n2: usize,
}

impl StateIterator {
    pub fn new(max_n1: usize, max_n2: usize) -> StateIterator {
        StateIterator { n1: 0, n2: 0, max_n1, max_n2 }
    }
}

impl Iterator for StateIterator {
    type Item = State;

    fn next(&mut self) -> Option<Self::Item> {
        if self.n1 > self.max_n1 {
            return None;
        }
        let state = State::new(self.n1, self.n2);
        if self.n2 < self.max_n2 {
            self.n2 += 1;
        } else {
            self.n2 = 0;
            self.n1 += 1;
        }
        Some(state)
    }
}


/// Cost charged for taking an action in a state.
pub trait ActionCost {
    fn cost(&self, state: &State, action: i32) -> f64;
}

/// Every car moved costs the same.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearMoveCost {
    pub per_car: f64,
}

impl ActionCost for LinearMoveCost {
    fn cost(&self, _state: &State, action: i32) -> f64 {
        self.per_car * action.unsigned_abs() as f64
    }
}

/// An employee shuttles `free_moves` cars from lot #1 to lot #2 for free, and
/// a lot keeping more than `overflow_threshold` cars overnight rents a second
/// parking lot for `overflow_fee`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HelpedMoveCost {
    pub per_car: f64,
    pub free_moves: i32,
    pub overflow_threshold: usize,
    pub overflow_fee: f64,
}

impl HelpedMoveCost {
    pub fn new(
        per_car: f64, free_moves: i32, overflow_threshold: usize, overflow_fee: f64,
    ) -> Result<HelpedMoveCost> {
        if free_moves < 0 {
            return Err(DpError::InvalidBound(format!(
                "free_moves {free_moves} must not be negative"
            )));
        }
        Ok(HelpedMoveCost { per_car, free_moves, overflow_threshold, overflow_fee })
    }
}

impl ActionCost for HelpedMoveCost {
    fn cost(&self, state: &State, action: i32) -> f64 {
        let paid_moves = if action > 0 {
            (action - self.free_moves).max(0)
        } else {
            -action
        };
        let parking: f64 = state.cars.iter()
            .zip(MOVE_SIGN)
            .map(|(&n, sign)| n as i64 + i64::from(sign * action))
            .filter(|&overnight| overnight > self.overflow_threshold as i64)
            .map(|_| self.overflow_fee)
            .sum();
        self.per_car * paid_moves as f64 + parking
    }
}


/// Precomputed dynamics of a single lot.
pub struct LotModel {
    pub lot: Lot,
    /// Transition kernel. Indexes: cars on lot after moving, cars on lot next morning
    pub kernel: Array2<f64>,
    /// Expected rental revenue. Indexes: action index, cars on lot at start of day,
    /// cars on lot next morning
    pub revenue: Array3<f64>,
    sign: i32,
}

impl LotModel {
    fn new(
        lot: Lot, sign: i32, max_move: i32, rent_price: f64, cutoff: usize,
    ) -> Result<LotModel> {
        let rent_pmf = truncated_pmf("rent_mean", lot.rent_mean, cutoff)?;
        let return_pmf = truncated_pmf("return_mean", lot.return_mean, cutoff)?;
        let kernel = LotModel::calc_kernel(lot.max_cars, &rent_pmf, &return_pmf);
        let revenue =
            LotModel::calc_revenue(lot.max_cars, sign, max_move, rent_price, &rent_pmf);
        Ok(LotModel { lot, kernel, revenue, sign })
    }

    /// Rentals happen before returns. Rentals stop when the lot is empty and
    /// returns beyond the lot maximum are lost.
    fn calc_kernel(max_n: usize, rent_pmf: &[f64], return_pmf: &[f64]) -> Array2<f64> {
        let dim = max_n + 1;
        let mut kernel = Array2::<f64>::zeros((dim, dim));
        for n in 0..dim {
            for (x, p_x) in rent_pmf.iter().enumerate() {
                let after_rentals = n.saturating_sub(x);
                for (y, p_y) in return_pmf.iter().enumerate() {
                    let next = (after_rentals + y).min(max_n);
                    kernel[[n, next]] += p_x * p_y;
                }
            }
        }
        kernel
    }

    fn calc_revenue(
        max_n: usize, sign: i32, max_move: i32, rent_price: f64, rent_pmf: &[f64],
    ) -> Array3<f64> {
        let dim = max_n + 1;
        let total_moves = (2 * max_move + 1) as usize;
        let mut revenue = Array3::<f64>::zeros((total_moves, dim, dim));
        for (ai, a) in (-max_move..=max_move).enumerate() {
            for n in 0..dim {
                // Infeasible entries stay zero and are never read.
                let Some(after_move) = shift(n, sign * a, max_n) else {
                    continue;
                };
                let expected_rented: f64 = rent_pmf.iter()
                    .enumerate()
                    .map(|(x, p)| p * x.min(after_move) as f64)
                    .sum();
                revenue.slice_mut(s![ai, n, ..]).fill(rent_price * expected_rented);
            }
        }
        revenue
    }

    fn after_move(&self, n: usize, a: i32) -> Option<usize> {
        shift(n, self.sign * a, self.lot.max_cars)
    }
}

/// Poisson pmf for `0..cutoff`. Mass at or above `cutoff` is dropped.
fn truncated_pmf(what: &'static str, mean: f64, cutoff: usize) -> Result<Vec<f64>> {
    if !(mean.is_finite() && mean > 0.0) {
        return Err(DpError::InvalidRate { what, value: mean });
    }
    let dist = Poisson::new(mean)
        .map_err(|_| DpError::InvalidRate { what, value: mean })?;
    let tail = dist.sf(cutoff as u64 - 1);
    if tail > TAIL_WARNING {
        warn!("{what} {mean}: cutoff {cutoff} drops {tail:.2e} of the probability mass");
    }
    Ok((0..cutoff as u64).map(|k| dist.pmf(k)).collect())
}

/// `n + delta`, if it stays within `0..=max_n`.
fn shift(n: usize, delta: i32, max_n: usize) -> Option<usize> {
    let moved = n as i64 + i64::from(delta);
    (0..=max_n as i64).contains(&moved).then_some(moved as usize)
}


/// Jack's car rental problem.
///
/// Rental and return probabilities are precalculated when the object is
/// constructed and never change afterwards. Each day the action moves cars
/// between the two lots overnight, then customers rent and return cars at
/// each lot independently.
pub struct CarRental {
    pub lots: [LotModel; 2],
    /// Maximum number of cars that can be moved between lot #1 and lot #2
    pub max_move: i32,
    /// Revenue for each car rented
    pub rent_price: f64,
    /// Poisson counts at or above this are treated as impossible
    pub poisson_cutoff: usize,
    cost: Box<dyn ActionCost>,
}

impl CarRental {
    pub fn new(
        lots: [Lot; 2],
        max_move: i32,
        rent_price: f64,
        poisson_cutoff: usize,
        cost: Box<dyn ActionCost>,
    ) -> Result<CarRental> {
        if lots.iter().any(|lot| lot.max_cars == 0) {
            return Err(DpError::InvalidBound("each lot must hold at least one car".into()));
        }
        let smallest = lots.iter().map(|lot| lot.max_cars).min().unwrap_or(0);
        if max_move < 0 || max_move as usize > smallest {
            return Err(DpError::InvalidBound(format!(
                "max_move {max_move} must be between 0 and the smallest lot maximum {smallest}"
            )));
        }
        if poisson_cutoff == 0 {
            return Err(DpError::InvalidBound("poisson_cutoff must be at least 1".into()));
        }
        if !rent_price.is_finite() {
            return Err(DpError::InvalidBound(format!("rent_price {rent_price} is not finite")));
        }
        let [lot1, lot2] = lots;
        debug!("Calculating rental and return probabilities.");
        let lots = [
            LotModel::new(lot1, MOVE_SIGN[0], max_move, rent_price, poisson_cutoff)?,
            LotModel::new(lot2, MOVE_SIGN[1], max_move, rent_price, poisson_cutoff)?,
        ];
        Ok(CarRental { lots, max_move, rent_price, poisson_cutoff, cost })
    }

    /// Number of inventory levels at each lot.
    pub fn dims(&self) -> (usize, usize) {
        (self.lots[0].lot.size(), self.lots[1].lot.size())
    }

    /// Linearized index of `state`, which must lie within both lots.
    pub fn index(&self, state: &State) -> Result<usize> {
        self.check_state(state)?;
        Ok(state.cars[0] * self.dims().1 + state.cars[1])
    }

    pub fn state(&self, index: usize) -> State {
        let cols = self.dims().1;
        State::new(index / cols, index % cols)
    }

    pub fn states(&self) -> StateIterator {
        StateIterator::new(self.lots[0].lot.max_cars, self.lots[1].lot.max_cars)
    }

    fn contains(&self, state: &State) -> bool {
        self.lots.iter().zip(state.cars).all(|(model, n)| n <= model.lot.max_cars)
    }

    /// Inventory at each lot after moving `action` cars, or `None` if the move
    /// is not allowed.
    pub fn after_move(&self, state: &State, action: i32) -> Option<[usize; 2]> {
        if action.abs() > self.max_move || !self.contains(state) {
            return None;
        }
        let n1 = self.lots[0].after_move(state.cars[0], action)?;
        let n2 = self.lots[1].after_move(state.cars[1], action)?;
        Some([n1, n2])
    }

    fn action_index(&self, action: i32) -> usize {
        (action + self.max_move) as usize
    }

    fn checked_move(&self, state: &State, action: i32) -> Result<[usize; 2]> {
        let index = self.index(state)?;
        self.after_move(state, action)
            .ok_or(DpError::InfeasibleAction { state: index, action })
    }

    fn check_state(&self, state: &State) -> Result<()> {
        if self.contains(state) {
            Ok(())
        } else {
            Err(DpError::InvalidBound(format!("state {state} is outside the lots")))
        }
    }

    /// Probability of reaching `next` from `state` after taking `action`.
    pub fn transition_prob(&self, state: &State, action: i32, next: &State) -> Result<f64> {
        self.check_state(next)?;
        let moved = self.checked_move(state, action)?;
        Ok(self.lots.iter()
            .zip(moved.iter().zip(next.cars))
            .map(|(model, (&m, n))| model.kernel[[m, n]])
            .product())
    }

    /// Expected rental revenue minus the cost of `action`.
    pub fn expected_reward(&self, action: i32, state: &State, next: &State) -> Result<f64> {
        self.check_state(next)?;
        self.checked_move(state, action)?;
        let ai = self.action_index(action);
        let revenue: f64 = self.lots.iter()
            .enumerate()
            .map(|(i, model)| model.revenue[[ai, state.cars[i], next.cars[i]]])
            .sum();
        Ok(revenue - self.cost.cost(state, action))
    }

    fn show_array(arr: &Array2<f64>, row_prefix: &str) {
        print!("  cars after move:");
        for n in 0..arr.dim().0 {
            print!("{:9}", n);
        }
        println!();
        for (x, col) in arr.columns().into_iter().enumerate() {
            print!("{row_prefix}: {x:>3} | ");
            for elem in col.iter() {
                print!("{:8.4} ", elem);
            }
            println!();
        }
    }

    pub fn show_probs(&self) {
        for (i, model) in self.lots.iter().enumerate() {
            println!("\n=== Location #{} Transition Probabilities ===", i + 1);
            CarRental::show_array(&model.kernel, "cars next morning");
        }
    }
}

impl Mdp for CarRental {
    fn num_states(&self) -> usize {
        let (rows, cols) = self.dims();
        rows * cols
    }

    fn actions(&self, state: usize) -> Vec<i32> {
        (-self.max_move..=self.max_move)
            .filter(|&a| self.is_feasible(state, a))
            .collect()
    }

    fn is_feasible(&self, state: usize, action: i32) -> bool {
        state < self.num_states() && self.after_move(&self.state(state), action).is_some()
    }

    fn expected_return(
        &self, state: usize, action: i32, value: &ValueFunction, gamma: f64,
    ) -> Result<f64> {
        if !self.is_feasible(state, action) {
            return Err(DpError::InfeasibleAction { state, action });
        }
        let s1 = self.state(state);
        let [m1, m2] = self.checked_move(&s1, action)?;
        let ai = self.action_index(action);
        let cost = self.cost.cost(&s1, action);
        let [lot1, lot2] = &self.lots;
        let (rows, cols) = self.dims();

        let mut total = 0.0;
        for n1 in 0..rows {
            let p1 = lot1.kernel[[m1, n1]];
            if p1 == 0.0 {
                continue;
            }
            let r1 = lot1.revenue[[ai, s1.cars[0], n1]];
            for n2 in 0..cols {
                let p2 = lot2.kernel[[m2, n2]];
                if p2 == 0.0 {
                    continue;
                }
                let reward = r1 + lot2.revenue[[ai, s1.cars[1], n2]] - cost;
                total += p1 * p2 * (reward + gamma * value[n1 * cols + n2]);
            }
        }
        Ok(total)
    }
}
