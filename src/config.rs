use serde::Deserialize;

use crate::cars::{ActionCost, CarRental, HelpedMoveCost, LinearMoveCost, Lot};
use crate::error::Result;
use crate::gambler::Gambler;
use crate::solver::{SolverConfig, TieBreakKind};

/// Hold information read from the TOML configuration file.
///
/// Every table is optional and falls back to the textbook values.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub rental: RentalConfig,
    pub gambler: GamblerConfig,
    pub solver: SolverConfig,
}


/// Cost of moving cars overnight.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostConfig {
    Linear {
        per_car: f64,
    },
    Helped {
        per_car: f64,
        free_moves: i32,
        overflow_threshold: usize,
        overflow_fee: f64,
    },
}

impl CostConfig {
    pub fn build(&self) -> Result<Box<dyn ActionCost>> {
        Ok(match *self {
            CostConfig::Linear { per_car } => Box::new(LinearMoveCost { per_car }),
            CostConfig::Helped { per_car, free_moves, overflow_threshold, overflow_fee } => {
                Box::new(HelpedMoveCost::new(per_car, free_moves, overflow_threshold, overflow_fee)?)
            }
        })
    }
}


#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RentalConfig {
    pub lots: [Lot; 2],
    pub max_move: i32,
    pub rent_price: f64,
    pub poisson_cutoff: usize,
    pub cost: CostConfig,
}

impl Default for RentalConfig {
    fn default() -> Self {
        RentalConfig {
            lots: [Lot::new(20, 3.0, 3.0), Lot::new(20, 4.0, 2.0)],
            max_move: 5,
            rent_price: 10.0,
            poisson_cutoff: 25,
            cost: CostConfig::Linear { per_car: 2.0 },
        }
    }
}

impl RentalConfig {
    pub fn build(&self) -> Result<CarRental> {
        CarRental::new(
            self.lots, self.max_move, self.rent_price, self.poisson_cutoff, self.cost.build()?,
        )
    }
}


#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GamblerConfig {
    pub win_prob: f64,
    pub goal: usize,
    pub goal_reward: f64,
    /// Replaces the solver discount rate; the problem is undiscounted by default
    pub gamma: f64,
    /// Replaces the solver tie break; ties go to the smaller stake by default
    pub tie_break: TieBreakKind,
}

impl Default for GamblerConfig {
    fn default() -> Self {
        GamblerConfig {
            win_prob: 0.4,
            goal: 100,
            goal_reward: 1.0,
            gamma: 1.0,
            tie_break: TieBreakKind::Conservative,
        }
    }
}

impl GamblerConfig {
    pub fn build(&self) -> Result<Gambler> {
        Gambler::new(self.win_prob, self.goal, self.goal_reward)
    }

    /// Solver settings for the gambler, using this table's discount rate and
    /// tie break.
    pub fn solver_config(&self, solver: &SolverConfig) -> SolverConfig {
        SolverConfig { gamma: self.gamma, tie_break: self.tie_break, ..solver.clone() }
    }
}
