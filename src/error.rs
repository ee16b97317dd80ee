use thiserror::Error;

/// Errors raised while building a model or running the solver.
#[derive(Debug, Error)]
pub enum DpError {
    #[error("{what} must be a positive finite rate, got {value}")]
    InvalidRate { what: &'static str, value: f64 },

    #[error("discount factor must be in (0, 1], got {0}")]
    InvalidDiscount(f64),

    #[error("{what} must be positive, got {value}")]
    InvalidThreshold { what: &'static str, value: f64 },

    #[error("probability must be in [0, 1], got {0}")]
    InvalidProbability(f64),

    #[error("invalid state-space bound: {0}")]
    InvalidBound(String),

    #[error("action {action} is infeasible in state {state}")]
    InfeasibleAction { state: usize, action: i32 },

    #[error("state {0} has no feasible action")]
    NoFeasibleAction(usize),

    #[error("policy covers {found} states, model has {expected}")]
    PolicyShape { expected: usize, found: usize },

    #[error("policy file: {0}")]
    Csv(#[from] csv::Error),

    #[error("policy file: cannot parse action {0:?}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, DpError>;
