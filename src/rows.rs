//! Row data exchanged with the engine.
//!
//! A [`RowBatch`] is the domain view of one streamed `BundledRows` message. Every [`Row`] is
//! positionally aligned with the declared parameters of the call, and every [`Dual`] carries
//! both a numeric and a string representation; the declared data type decides which one is
//! meaningful.

use crate::error::{Error, ErrorKind, Result};
use crate::proto::sse as proto;

/// A single value slot carrying a numeric and a string representation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dual {
    pub num: f64,
    pub str: String,
}

impl Dual {
    pub fn new(num: f64, str: impl Into<String>) -> Self {
        Self {
            num,
            str: str.into(),
        }
    }

    /// A dual where only the numeric representation is meaningful.
    pub fn numeric(num: f64) -> Self {
        Self::new(num, String::new())
    }

    /// A dual where only the string representation is meaningful.
    pub fn string(str: impl Into<String>) -> Self {
        Self::new(0.0, str)
    }
}

/// One row of values, ordered like the declared parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub duals: Vec<Dual>,
}

impl Row {
    pub fn new(duals: Vec<Dual>) -> Self {
        Self { duals }
    }

    /// A row holding exactly one value.
    pub fn single(dual: Dual) -> Self {
        Self { duals: vec![dual] }
    }

    pub fn len(&self) -> usize {
        self.duals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.duals.is_empty()
    }

    /// The value at `index`, or a validation error naming `owner` when the row is too short.
    pub fn column(&self, index: usize, owner: &str) -> Result<&Dual> {
        self.duals.get(index).ok_or_else(|| {
            Error::FunctionError(ErrorKind::ValidationError(format!(
                "{owner}: row has {} column(s), column {index} is required",
                self.duals.len()
            )))
        })
    }
}

/// An ordered batch of rows, the unit of streaming in both directions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowBatch {
    pub rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl From<proto::Dual> for Dual {
    fn from(value: proto::Dual) -> Self {
        Self {
            num: value.num_data,
            str: value.str_data,
        }
    }
}

impl From<Dual> for proto::Dual {
    fn from(value: Dual) -> Self {
        proto::Dual {
            num_data: value.num,
            str_data: value.str,
        }
    }
}

impl From<proto::Row> for Row {
    fn from(value: proto::Row) -> Self {
        Self {
            duals: value.duals.into_iter().map(Dual::from).collect(),
        }
    }
}

impl From<Row> for proto::Row {
    fn from(value: Row) -> Self {
        proto::Row {
            duals: value.duals.into_iter().map(proto::Dual::from).collect(),
        }
    }
}

impl From<proto::BundledRows> for RowBatch {
    fn from(value: proto::BundledRows) -> Self {
        Self {
            rows: value.rows.into_iter().map(Row::from).collect(),
        }
    }
}

impl From<RowBatch> for proto::BundledRows {
    fn from(value: RowBatch) -> Self {
        proto::BundledRows {
            rows: value.rows.into_iter().map(proto::Row::from).collect(),
        }
    }
}

impl From<Row> for RowBatch {
    fn from(value: Row) -> Self {
        Self { rows: vec![value] }
    }
}
