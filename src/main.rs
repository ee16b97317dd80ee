use std::{error::Error, fs::File, path::{Path, PathBuf}};

use clap::{Parser, Subcommand};
use config_file::FromConfigFile;
use log::info;

use rustdp::{
    cars::{CarRental, State},
    config::Config,
    mdp::Mdp,
    policy::{write_policies_csv, Policy, ValueFunction},
    solver::Solver,
};


/// Command line argument parser.
#[derive(Parser, Debug)]
#[command(about = "Solve the Sutton and Barto dynamic programming problems", long_about = None)]
pub struct Args {
    /// Path to configuration TOML file.
    config_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}


#[derive(Subcommand, Debug)]
enum Commands {
    /// Print rental and return transition probabilities.
    Probs,
    /// Calculate expected reward for a state and action.
    Reward {
        n1: usize,
        n2: usize,
        #[arg(allow_negative_numbers = true)]
        a: i32,
    },
    /// Solve the car rental problem by policy iteration.
    Solve {
        /// Write every policy visited to this CSV file.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Solve the gambler's problem by value iteration.
    Gambler {
        /// Write the greedy policy to this CSV file.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}


fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = read_config(&args.config_path)?;

    match &args.command {
        Commands::Probs => {
            let cars = config.rental.build()?;
            cars.show_probs();
        }
        Commands::Reward { n1, n2, a } => {
            let cars = config.rental.build()?;
            let s1 = State::new(*n1, *n2);
            let value = ValueFunction::zeros(cars.num_states());
            let r = cars.expected_return(cars.index(&s1)?, *a, &value, config.solver.gamma)?;
            println!("Expected Reward: {:.2}", r);
        }
        Commands::Solve { out } => {
            let cars = config.rental.build()?;
            let mut solver = Solver::new(&cars, config.solver.clone())?;
            let result = solver.run_policy_iteration(cars.initial_policy())?;
            for (i, policy) in result.policies.iter().enumerate() {
                println!("\n=== Policy {} ===", i);
                show_policy(&cars, policy)?;
            }
            println!("\n=== Value Function ===");
            show_value(&cars, &result.value)?;
            if !result.converged {
                println!("Policy did not stabilize; showing best effort.");
            }
            if let Some(path) = out {
                write_policies(&result.policies, path)?;
            }
        }
        Commands::Gambler { out } => {
            let gambler = config.gambler.build()?;
            let mut solver = Solver::new(&gambler, config.gambler.solver_config(&config.solver))?;
            let history = solver.value_iteration()?;
            let value = history.last()
                .cloned()
                .unwrap_or_else(|| ValueFunction::zeros(gambler.num_states()));
            let policy = solver.improve(&value)?;
            info!("value iteration finished after {} sweeps", history.len());
            println!("{:>8} {:>10} {:>6}", "capital", "value", "stake");
            for (capital, (v, a)) in value.iter().zip(policy.actions.iter()).enumerate() {
                println!("{capital:>8} {v:>10.6} {a:>6}");
            }
            if let Some(path) = out {
                write_policies(std::slice::from_ref(&policy), path)?;
            }
        }
    }
    Ok(())
}


fn read_config(config_path: &Path) -> Result<Config, Box<dyn Error>> {
    info!("Reading config file: {}", config_path.display());
    Ok(Config::from_config_file(config_path)?)
}

fn write_policies(policies: &[Policy], path: &Path) -> Result<(), Box<dyn Error>> {
    info!("Writing {} policies to {}", policies.len(), path.display());
    write_policies_csv(policies, File::create(path)?)?;
    Ok(())
}

/// Print one row per lot #1 inventory level, one column per lot #2 level.
fn show_policy(cars: &CarRental, policy: &Policy) -> Result<(), Box<dyn Error>> {
    let (_, cols) = cars.dims();
    print!("  n1 \\ n2 |");
    for n2 in 0..cols {
        print!("{:4}", n2);
    }
    println!();
    let states: Vec<State> = cars.states().collect();
    for row in states.chunks(cols).rev() {
        print!("{:>9} |", row[0].cars[0]);
        for s in row {
            print!("{:4}", policy.action(cars.index(s)?));
        }
        println!();
    }
    Ok(())
}

fn show_value(cars: &CarRental, value: &ValueFunction) -> Result<(), Box<dyn Error>> {
    let (_, cols) = cars.dims();
    let states: Vec<State> = cars.states().collect();
    for row in states.chunks(cols).rev() {
        print!("{:>9} |", row[0].cars[0]);
        for s in row {
            print!("{:8.1}", value[cars.index(s)?]);
        }
        println!();
    }
    Ok(())
}
