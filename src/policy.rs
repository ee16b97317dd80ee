use std::io;

use ndarray::Array1;

use crate::error::{DpError, Result};

/// State values indexed by linearized state.
pub type ValueFunction = Array1<f64>;

/// Deterministic policy. One action per linearized state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub actions: Array1<i32>,
}

impl Policy {
    pub fn new(actions: Array1<i32>) -> Policy {
        Policy { actions }
    }

    /// The no-op policy.
    pub fn zeros(num_states: usize) -> Policy {
        Policy { actions: Array1::<i32>::zeros(num_states) }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn action(&self, state: usize) -> i32 {
        self.actions[state]
    }

    /// Number of states where `self` and `other` choose different actions.
    pub fn changed_states(&self, other: &Policy) -> usize {
        self.actions.iter()
            .zip(other.actions.iter())
            .filter(|(a, b)| a != b)
            .count()
    }

    /// Write the policy as a single CSV row of actions.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        write_policies_csv(std::slice::from_ref(self), writer)
    }

    /// Read a policy written by [`Policy::write_csv`].
    pub fn read_csv<R: io::Read>(reader: R) -> Result<Policy> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(reader);
        let record = match rdr.records().next() {
            Some(record) => record?,
            None => return Ok(Policy::zeros(0)),
        };
        let actions = record.iter()
            .map(|field| field.trim().parse::<i32>()
                .map_err(|_| DpError::Parse(field.to_string())))
            .collect::<Result<Vec<i32>>>()?;
        Ok(Policy::new(Array1::from(actions)))
    }
}

/// Write a policy sequence, one policy per row.
pub fn write_policies_csv<W: io::Write>(policies: &[Policy], writer: W) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(writer);
    for policy in policies {
        wtr.write_record(policy.actions.iter().map(|a| a.to_string()))?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}
