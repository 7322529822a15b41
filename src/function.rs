//! Registered functions and the dispatcher driving them over the incoming batches.
//!
//! A [`FunctionTable`] is built once at startup. Each [`RegisteredFunction`] pairs the
//! definition advertised to the engine with a [`Convention`], the strategy used to turn incoming
//! batches into outgoing ones:
//!
//! - [`Convention::Scalar`] computes one row per incoming row and sends it right away.
//! - [`Convention::Tensor`] computes one batch per incoming batch.
//! - [`Convention::Aggregation`] folds every row into an [`AggregationState`] and sends a single
//!   row once the input ends.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info};

use crate::aggregate::AggregationState;
use crate::descriptor::{DataType, FunctionType, Param, RequestDescriptor};
use crate::error::{Error, ErrorKind, Result};
use crate::proto::sse as proto;
use crate::rows::{Row, RowBatch};

mod builtin;

/// Computes one output row from one input row.
pub type ScalarFn = Arc<dyn Fn(&Row) -> Result<Row> + Send + Sync>;

/// Computes one output batch from one input batch.
pub type TensorFn = Arc<dyn Fn(RowBatch) -> Result<RowBatch> + Send + Sync>;

/// Calling convention of a registered function.
#[derive(Clone)]
pub enum Convention {
    Scalar(ScalarFn),
    Tensor(TensorFn),
    /// Seed of the per-call accumulator.
    Aggregation(fn() -> AggregationState),
}

impl Convention {
    pub fn function_type(&self) -> FunctionType {
        match self {
            Convention::Scalar(_) => FunctionType::Scalar,
            Convention::Tensor(_) => FunctionType::Tensor,
            Convention::Aggregation(_) => FunctionType::Aggregation,
        }
    }
}

/// The capability-listing view of a registered function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub function_id: i32,
    pub name: String,
    pub function_type: FunctionType,
    pub return_type: DataType,
    pub params: Vec<Param>,
}

impl From<&FunctionDefinition> for proto::FunctionDefinition {
    fn from(value: &FunctionDefinition) -> Self {
        proto::FunctionDefinition {
            name: value.name.clone(),
            function_type: value.function_type as i32,
            return_type: value.return_type as i32,
            params: value.params.iter().map(proto::Parameter::from).collect(),
            function_id: value.function_id,
        }
    }
}

/// A function the engine can call through `ExecuteFunction`.
#[derive(Clone)]
pub struct RegisteredFunction {
    definition: FunctionDefinition,
    convention: Convention,
    no_cache: bool,
}

impl RegisteredFunction {
    pub fn new(
        function_id: i32,
        name: impl Into<String>,
        return_type: DataType,
        params: Vec<Param>,
        convention: Convention,
    ) -> Self {
        Self {
            definition: FunctionDefinition {
                function_id,
                name: name.into(),
                function_type: convention.function_type(),
                return_type,
                params,
            },
            convention,
            no_cache: false,
        }
    }

    pub fn scalar<F>(
        function_id: i32,
        name: impl Into<String>,
        return_type: DataType,
        params: Vec<Param>,
        f: F,
    ) -> Self
    where
        F: Fn(&Row) -> Result<Row> + Send + Sync + 'static,
    {
        Self::new(function_id, name, return_type, params, Convention::Scalar(Arc::new(f)))
    }

    pub fn tensor<F>(
        function_id: i32,
        name: impl Into<String>,
        return_type: DataType,
        params: Vec<Param>,
        f: F,
    ) -> Self
    where
        F: Fn(RowBatch) -> Result<RowBatch> + Send + Sync + 'static,
    {
        Self::new(function_id, name, return_type, params, Convention::Tensor(Arc::new(f)))
    }

    pub fn aggregation(
        function_id: i32,
        name: impl Into<String>,
        return_type: DataType,
        params: Vec<Param>,
        seed: fn() -> AggregationState,
    ) -> Self {
        Self::new(function_id, name, return_type, params, Convention::Aggregation(seed))
    }

    /// Marks the results of this function as not cacheable by the engine.
    pub fn with_no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    pub fn definition(&self) -> &FunctionDefinition {
        &self.definition
    }

    pub fn convention(&self) -> &Convention {
        &self.convention
    }

    /// The descriptor of a call to this function.
    pub fn descriptor(&self) -> RequestDescriptor {
        RequestDescriptor {
            function_id: self.definition.function_id,
            function_type: self.definition.function_type,
            params: self.definition.params.clone(),
            return_type: self.definition.return_type,
            script: None,
        }
    }
}

/// Registration table of every function exposed by the plugin, keyed by function id.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: BTreeMap<i32, Arc<RegisteredFunction>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The example functions shipped with the plugin.
    pub fn builtin() -> Self {
        builtin::table()
    }

    /// Registers `function`, replacing any function previously registered under the same id.
    pub fn register(mut self, function: RegisteredFunction) -> Self {
        self.functions
            .insert(function.definition.function_id, Arc::new(function));
        self
    }

    pub fn get(&self, function_id: i32) -> Option<Arc<RegisteredFunction>> {
        self.functions.get(&function_id).cloned()
    }

    /// Like [`FunctionTable::get`], failing with [`ErrorKind::UnknownFunction`].
    pub fn resolve(&self, function_id: i32) -> Result<Arc<RegisteredFunction>> {
        self.get(function_id)
            .ok_or(Error::FunctionError(ErrorKind::UnknownFunction(function_id)))
    }

    /// Definitions in function id order.
    pub fn definitions(&self) -> impl Iterator<Item = &FunctionDefinition> {
        self.functions.values().map(|f| f.definition())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

async fn send(
    response_tx: &mpsc::Sender<std::result::Result<proto::BundledRows, Status>>,
    batch: RowBatch,
) -> Result<()> {
    response_tx.send(Ok(batch.into())).await.map_err(|e| {
        Error::FunctionError(ErrorKind::InternalError(format!(
            "failed to send response: {e}"
        )))
    })
}

/// Drives `function` over every batch of `input`, sending results on `response_tx`.
///
/// Batches are processed strictly in arrival order. The first error ends the call; a pending
/// aggregate is only resolved once the input has ended cleanly.
pub async fn dispatch<S>(
    function: Arc<RegisteredFunction>,
    mut input: S,
    response_tx: mpsc::Sender<std::result::Result<proto::BundledRows, Status>>,
    token: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<RowBatch>> + Unpin,
{
    let name = function.definition.name.as_str();
    let mut state = match &function.convention {
        Convention::Aggregation(seed) => Some(seed()),
        _ => None,
    };

    loop {
        let next = tokio::select! {
            next = input.next() => next,
            _ = token.cancelled() => {
                info!("Cancellation token is cancelled, stopping {name}");
                return Err(Error::GrpcStatus(Status::cancelled("server is shutting down")));
            }
        };
        let Some(batch) = next else { break };
        let batch = batch?;
        debug!(function = name, rows = batch.len(), "Received batch");
        if batch.is_empty() {
            continue;
        }

        match &function.convention {
            Convention::Scalar(f) => {
                for row in &batch.rows {
                    let out = f(row)?;
                    send(&response_tx, out.into()).await?;
                }
            }
            Convention::Tensor(f) => {
                let out = f(batch)?;
                send(&response_tx, out).await?;
            }
            Convention::Aggregation(_) => {
                if let Some(state) = state.as_mut() {
                    for row in &batch.rows {
                        state.fold(row, name)?;
                    }
                }
            }
        }
    }

    if let Some(state) = state {
        send(&response_tx, state.resolve().into()).await?;
    }
    Ok(())
}
