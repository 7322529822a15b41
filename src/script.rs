//! Script evaluation.
//!
//! Scripts are evaluated by a [`ScriptEngine`]. An engine hands out one [`ScriptSession`] per
//! call; sessions are not required to be `Send`, so each call drives its session from a
//! dedicated blocking worker ([`ScriptWorker`]) fed through a channel. The declared parameter
//! values of a row are bound, in order, as the `args` list visible to the script, and the raw
//! result is converted back into the declared return type.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info};

use crate::aggregate::ColumnAccumulator;
use crate::descriptor::{DataType, FunctionType, Param, RequestDescriptor};
use crate::error::{Error, ErrorKind, Result};
use crate::proto::sse as proto;
use crate::rows::{Dual, Row, RowBatch};

mod boa;

pub use boa::BoaEngine;

/// A value bound into the script, shaped by the declared parameter type.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Number(f64),
    Text(String),
    /// Bound as a two element list `[number, string]`.
    Dual(f64, String),
    List(Vec<ScriptValue>),
}

impl ScriptValue {
    pub fn bind(dual: &Dual, data_type: DataType) -> Self {
        match data_type {
            DataType::Numeric => ScriptValue::Number(dual.num),
            DataType::String => ScriptValue::Text(dual.str.clone()),
            DataType::Dual => ScriptValue::Dual(dual.num, dual.str.clone()),
        }
    }
}

/// Binds the values of `row` positionally against `params`.
pub fn bind_row(row: &Row, params: &[Param]) -> Result<Vec<ScriptValue>> {
    if row.len() < params.len() {
        return Err(Error::ScriptError(ErrorKind::ValidationError(format!(
            "row has {} value(s) but {} parameter(s) are declared",
            row.len(),
            params.len()
        ))));
    }
    Ok(params
        .iter()
        .zip(&row.duals)
        .map(|(param, dual)| ScriptValue::bind(dual, param.data_type))
        .collect())
}

/// Converts the textual result of a script into the declared return type.
pub fn convert_result(text: String, return_type: DataType) -> Result<Dual> {
    let parse = |text: &str| {
        text.trim().parse::<f64>().map_err(|_| {
            Error::ScriptError(ErrorKind::TypeConversionError(format!(
                "script result {text:?} is not a number"
            )))
        })
    };
    match return_type {
        DataType::String => Ok(Dual::string(text)),
        DataType::Numeric => Ok(Dual::numeric(parse(&text)?)),
        DataType::Dual => Ok(Dual::new(parse(&text)?, text)),
    }
}

/// Capability of evaluating script text against an argument list.
pub trait ScriptEngine: Send + Sync {
    /// Creates the execution context used for the whole of one call.
    fn session(&self) -> Result<Box<dyn ScriptSession>>;
}

/// Execution context of a single call.
pub trait ScriptSession {
    /// Evaluates `script` with `args` bound and returns the result in its textual form.
    fn evaluate(&mut self, script: &str, args: &[ScriptValue]) -> Result<String>;
}

struct Job {
    args: Vec<ScriptValue>,
    reply: oneshot::Sender<Result<String>>,
}

/// Per-call blocking worker owning the call's [`ScriptSession`].
///
/// The session lives on the worker thread and is dropped when the worker is dropped, which
/// closes the job channel.
pub struct ScriptWorker {
    jobs: mpsc::Sender<Job>,
}

impl ScriptWorker {
    pub fn spawn(engine: Arc<dyn ScriptEngine>, script: String) -> Self {
        let (jobs, mut job_rx) = mpsc::channel::<Job>(1);
        tokio::task::spawn_blocking(move || {
            let mut session = match engine.session() {
                Ok(session) => session,
                Err(e) => {
                    while let Some(job) = job_rx.blocking_recv() {
                        let _ = job.reply.send(Err(e.clone()));
                    }
                    return;
                }
            };
            while let Some(job) = job_rx.blocking_recv() {
                let result = session.evaluate(&script, &job.args);
                let _ = job.reply.send(result);
            }
        });
        Self { jobs }
    }

    pub async fn evaluate(&self, args: Vec<ScriptValue>) -> Result<String> {
        let (reply, result) = oneshot::channel();
        self.jobs.send(Job { args, reply }).await.map_err(|_| {
            Error::ScriptError(ErrorKind::InternalError(
                "script worker is not running".to_string(),
            ))
        })?;
        result.await.map_err(|_| {
            Error::ScriptError(ErrorKind::InternalError(
                "script worker stopped before replying".to_string(),
            ))
        })?
    }
}

/// How a script call consumes its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptMode {
    /// No parameters: evaluate once, independent of the input.
    Once,
    /// Evaluate once per incoming row.
    PerRow,
    /// Collect every row, evaluate once over the columns at end of input.
    Aggregate,
}

impl ScriptMode {
    /// Selects the mode for `descriptor`. A parameterless aggregation is rejected here, before
    /// any script is run.
    pub fn select(descriptor: &RequestDescriptor) -> Result<Self> {
        match (descriptor.params.is_empty(), descriptor.function_type) {
            (true, FunctionType::Aggregation) => Err(Error::ScriptError(
                ErrorKind::UnsupportedMode(
                    "aggregation scripts require at least one parameter".to_string(),
                ),
            )),
            (true, _) => Ok(ScriptMode::Once),
            (false, FunctionType::Aggregation) => Ok(ScriptMode::Aggregate),
            (false, _) => Ok(ScriptMode::PerRow),
        }
    }
}

type ResponseSender = mpsc::Sender<std::result::Result<proto::BundledRows, Status>>;

async fn send(
    response_tx: &ResponseSender,
    batch: RowBatch,
) -> Result<()> {
    response_tx.send(Ok(batch.into())).await.map_err(|e| {
        Error::ScriptError(ErrorKind::InternalError(format!(
            "failed to send response: {e}"
        )))
    })
}

/// Hands `args` to the worker, giving up as soon as the server shuts down or the caller goes
/// away. Dropping the worker afterwards closes its job channel.
async fn run_script(
    worker: &ScriptWorker,
    args: Vec<ScriptValue>,
    response_tx: &ResponseSender,
    token: &CancellationToken,
) -> Result<String> {
    tokio::select! {
        result = worker.evaluate(args) => result,
        _ = token.cancelled() => {
            info!("Cancellation token is cancelled, stopping script evaluation");
            Err(Error::GrpcStatus(Status::cancelled("server is shutting down")))
        }
        _ = response_tx.closed() => {
            debug!("Response stream closed, stopping script evaluation");
            Err(Error::GrpcStatus(Status::cancelled("response stream closed")))
        }
    }
}

/// Drives one script call over `input`, sending results on `response_tx`.
///
/// Nothing is sent until the whole input has been evaluated: one failing row fails the call
/// without any output.
pub async fn evaluate<S>(
    descriptor: Arc<RequestDescriptor>,
    mode: ScriptMode,
    worker: ScriptWorker,
    mut input: S,
    response_tx: ResponseSender,
    token: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<RowBatch>> + Unpin,
{
    let return_type = descriptor.return_type;

    if mode == ScriptMode::Once {
        let text = run_script(&worker, Vec::new(), &response_tx, &token).await?;
        let row = Row::single(convert_result(text, return_type)?);
        return send(&response_tx, row.into()).await;
    }

    let mut columns =
        (mode == ScriptMode::Aggregate).then(|| ColumnAccumulator::new(&descriptor.params));
    let mut pending: Vec<RowBatch> = Vec::new();

    loop {
        let next = tokio::select! {
            next = input.next() => next,
            _ = token.cancelled() => {
                info!("Cancellation token is cancelled, stopping script evaluation");
                return Err(Error::GrpcStatus(Status::cancelled("server is shutting down")));
            }
            _ = response_tx.closed() => {
                debug!("Response stream closed, stopping script evaluation");
                return Err(Error::GrpcStatus(Status::cancelled("response stream closed")));
            }
        };
        let Some(batch) = next else { break };
        let batch = batch?;
        debug!(rows = batch.len(), "Received script batch");

        if let Some(columns) = columns.as_mut() {
            for row in &batch.rows {
                columns.push(row)?;
            }
            continue;
        }

        if batch.is_empty() {
            continue;
        }
        let mut rows = Vec::with_capacity(batch.len());
        for row in &batch.rows {
            let args = bind_row(row, &descriptor.params)?;
            let text = run_script(&worker, args, &response_tx, &token).await?;
            rows.push(Row::single(convert_result(text, return_type)?));
        }
        pending.push(RowBatch::new(rows));
    }

    if let Some(columns) = columns {
        let text = run_script(&worker, columns.into_args(), &response_tx, &token).await?;
        let row = Row::single(convert_result(text, return_type)?);
        return send(&response_tx, row.into()).await;
    }
    for batch in pending {
        send(&response_tx, batch).await?;
    }
    Ok(())
}
