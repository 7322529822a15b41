//! Accumulators folded across every incoming batch of a call.
//!
//! Nothing is emitted while a call is accumulating; the state is consumed exactly once when the
//! input ends. If the input fails or the call is cancelled the state is simply dropped.

use crate::descriptor::Param;
use crate::error::Result;
use crate::rows::{Dual, Row};
use crate::script::{ScriptValue, bind_row};

/// Running state of a built-in aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationState {
    /// Sum of the first column's numeric values.
    Sum(f64),
    /// Concatenation of the first column's string values in arrival order.
    Concat(String),
}

impl AggregationState {
    pub fn sum() -> Self {
        AggregationState::Sum(0.0)
    }

    pub fn concat() -> Self {
        AggregationState::Concat(String::new())
    }

    /// Folds one row into the state. `owner` names the function in validation errors.
    pub fn fold(&mut self, row: &Row, owner: &str) -> Result<()> {
        match self {
            AggregationState::Sum(sum) => *sum += row.column(0, owner)?.num,
            AggregationState::Concat(text) => text.push_str(&row.column(0, owner)?.str),
        }
        Ok(())
    }

    /// Resolves the state into the single output row of the call.
    pub fn resolve(self) -> Row {
        match self {
            AggregationState::Sum(sum) => Row::single(Dual::numeric(sum)),
            AggregationState::Concat(text) => Row::single(Dual::string(text)),
        }
    }
}

/// Collects bound script arguments column-wise, one column per declared parameter.
#[derive(Debug, Clone)]
pub struct ColumnAccumulator {
    params: Vec<Param>,
    columns: Vec<Vec<ScriptValue>>,
}

impl ColumnAccumulator {
    pub fn new(params: &[Param]) -> Self {
        Self {
            params: params.to_vec(),
            columns: vec![Vec::new(); params.len()],
        }
    }

    pub fn push(&mut self, row: &Row) -> Result<()> {
        let values = bind_row(row, &self.params)?;
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.push(value);
        }
        Ok(())
    }

    /// One list argument per parameter, holding that parameter's values in arrival order.
    pub fn into_args(self) -> Vec<ScriptValue> {
        self.columns.into_iter().map(ScriptValue::List).collect()
    }
}
