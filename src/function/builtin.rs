//! Example functions exposed by the basic plugin.

use chrono::Utc;

use super::{FunctionTable, RegisteredFunction};
use crate::aggregate::AggregationState;
use crate::descriptor::{DataType, Param};
use crate::error::Result;
use crate::rows::{Dual, Row, RowBatch};

pub(super) fn table() -> FunctionTable {
    FunctionTable::new()
        .register(RegisteredFunction::scalar(
            0,
            "HelloWorld",
            DataType::String,
            vec![Param::new("str1", DataType::String)],
            hello_world,
        ))
        .register(RegisteredFunction::scalar(
            1,
            "SumOfRows",
            DataType::Numeric,
            vec![
                Param::new("col1", DataType::Numeric),
                Param::new("col2", DataType::Numeric),
            ],
            sum_of_rows,
        ))
        .register(RegisteredFunction::aggregation(
            2,
            "SumOfColumn",
            DataType::Numeric,
            vec![Param::new("column", DataType::Numeric)],
            AggregationState::sum,
        ))
        .register(RegisteredFunction::aggregation(
            3,
            "StringAggregation",
            DataType::String,
            vec![Param::new("columnOfStrings", DataType::String)],
            AggregationState::concat,
        ))
        .register(RegisteredFunction::tensor(
            4,
            "Cache",
            DataType::String,
            vec![Param::new("columnOfStrings", DataType::String)],
            |batch| stamp(batch, "Cache"),
        ))
        .register(
            RegisteredFunction::tensor(
                5,
                "NoCache",
                DataType::String,
                vec![Param::new("columnOfStrings", DataType::String)],
                |batch| stamp(batch, "NoCache"),
            )
            .with_no_cache(),
        )
}

fn hello_world(row: &Row) -> Result<Row> {
    let text = &row.column(0, "HelloWorld")?.str;
    Ok(Row::single(Dual::string(text.clone())))
}

fn sum_of_rows(row: &Row) -> Result<Row> {
    let first = row.column(0, "SumOfRows")?.num;
    let second = row.column(1, "SumOfRows")?.num;
    let rest: f64 = row.duals.iter().skip(2).map(|d| d.num).sum();
    Ok(Row::single(Dual::numeric(first + second + rest)))
}

/// Appends the evaluation time to every string, so repeated calls are distinguishable.
fn stamp(batch: RowBatch, owner: &str) -> Result<RowBatch> {
    let now = Utc::now().to_rfc3339();
    batch
        .rows
        .iter()
        .map(|row| {
            let text = &row.column(0, owner)?.str;
            Ok(Row::single(Dual::string(format!("{text}___{now}"))))
        })
        .collect::<Result<Vec<_>>>()
        .map(RowBatch::new)
}
