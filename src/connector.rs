//! The `qlik.sse.Connector` gRPC service and the server hosting it.
//!
//! Every streaming call goes through the same prelude before any row data is read: the request
//! header is decoded into a [`RequestDescriptor`](crate::descriptor::RequestDescriptor), stored
//! in the call context store, and the cache header of the response is decided from it. The rows
//! are then processed by a spawned per-call task, which owns the call's context guard and ends
//! the response stream with an error status if anything fails. A failing call never affects any
//! other call or the server itself.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming, async_trait};
use tracing::{debug, error, info};

use crate::cache_policy;
use crate::capabilities::capabilities;
use crate::context::{CallContextGuard, CallContextStore};
use crate::descriptor::{self, FUNCTION_REQUEST_HEADER, RequestDescriptor, SCRIPT_REQUEST_HEADER};
use crate::error::{Error, ErrorKind, Result};
use crate::function::{self, FunctionTable};
use crate::proto::sse::{self as proto, connector_server};
use crate::rows::RowBatch;
use crate::script::{self, ScriptEngine, ScriptMode, ScriptWorker};
use crate::shared::{
    self, Listen, ServerConfig, SocketCleanup, create_tcp_listener_stream,
    create_unix_listener_stream,
};

/// Default channel size for the response stream of a call
const CHANNEL_SIZE: usize = 1000;

type ResponseSender = mpsc::Sender<std::result::Result<proto::BundledRows, Status>>;

struct ConnectorService {
    functions: Arc<FunctionTable>,
    contexts: CallContextStore,
    script_engine: Option<Arc<dyn ScriptEngine>>,
    plugin_identifier: String,
    plugin_version: String,
    cancellation_token: CancellationToken,
}

impl ConnectorService {
    /// Logs the optional common header of a call.
    fn log_common_header(&self, request: &Request<Streaming<proto::BundledRows>>) {
        if let Some(common) = descriptor::decode_common_header(request.metadata()) {
            debug!(
                app_id = %common.app_id,
                user_id = %common.user_id,
                cardinality = common.cardinality,
                "Common request header"
            );
        }
    }

    /// Stores `descriptor` for the call and reads it back as the call's view of its context.
    fn open_call(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<(CallContextGuard, Arc<RequestDescriptor>)> {
        let guard = self.contexts.open(descriptor);
        let descriptor = guard.descriptor().ok_or_else(|| {
            Error::ConnectorError(ErrorKind::InternalError(format!(
                "context of call {} is missing",
                guard.id()
            )))
        })?;
        Ok((guard, descriptor))
    }

    /// Creates the response of a call with its cache header already decided.
    fn response(
        &self,
        guard: &CallContextGuard,
    ) -> (
        ResponseSender,
        Response<ReceiverStream<std::result::Result<proto::BundledRows, Status>>>,
    ) {
        let (response_tx, response_rx) = mpsc::channel(CHANNEL_SIZE);
        let mut response = Response::new(ReceiverStream::new(response_rx));
        cache_policy::apply(
            &self.contexts,
            &guard.id(),
            &self.functions,
            response.metadata_mut(),
        );
        (response_tx, response)
    }
}

fn row_batches(
    stream: Streaming<proto::BundledRows>,
) -> impl Stream<Item = Result<RowBatch>> + Send + Unpin + 'static {
    stream.map(|batch| batch.map(RowBatch::from).map_err(Error::GrpcStatus))
}

#[async_trait]
impl connector_server::Connector for ConnectorService {
    async fn get_capabilities(
        &self,
        _: Request<proto::Empty>,
    ) -> std::result::Result<Response<proto::Capabilities>, Status> {
        let capabilities = capabilities(
            &self.functions,
            self.script_engine.is_some(),
            &self.plugin_identifier,
            &self.plugin_version,
        );
        debug!(
            functions = capabilities.functions.len(),
            allow_script = capabilities.allow_script,
            "Capabilities requested"
        );
        Ok(Response::new(capabilities))
    }

    type ExecuteFunctionStream = ReceiverStream<std::result::Result<proto::BundledRows, Status>>;

    async fn execute_function(
        &self,
        request: Request<Streaming<proto::BundledRows>>,
    ) -> std::result::Result<Response<Self::ExecuteFunctionStream>, Status> {
        let header = descriptor::read_header(request.metadata(), FUNCTION_REQUEST_HEADER)?;
        let descriptor = descriptor::decode_function_header(&header, &self.functions)?;
        self.log_common_header(&request);

        let (guard, descriptor) = self.open_call(descriptor)?;
        let function = self.functions.resolve(descriptor.function_id)?;
        info!(
            call_id = %guard.id(),
            function_id = descriptor.function_id,
            name = %function.definition().name,
            "ExecuteFunction called"
        );

        let (response_tx, response) = self.response(&guard);
        let input = row_batches(request.into_inner());
        let call = function::dispatch(
            function,
            input,
            response_tx.clone(),
            self.cancellation_token.clone(),
        );
        tokio::spawn(run_call(guard, response_tx, call));

        Ok(response)
    }

    type EvaluateScriptStream = ReceiverStream<std::result::Result<proto::BundledRows, Status>>;

    async fn evaluate_script(
        &self,
        request: Request<Streaming<proto::BundledRows>>,
    ) -> std::result::Result<Response<Self::EvaluateScriptStream>, Status> {
        let engine = self
            .script_engine
            .clone()
            .ok_or_else(|| Status::unimplemented("script evaluation is not enabled"))?;
        let header = descriptor::read_header(request.metadata(), SCRIPT_REQUEST_HEADER)?;
        let descriptor = descriptor::decode_script_header(&header)?;
        let mode = ScriptMode::select(&descriptor)?;
        self.log_common_header(&request);

        let (guard, descriptor) = self.open_call(descriptor)?;
        let script = descriptor.script.clone().unwrap_or_default();
        info!(
            call_id = %guard.id(),
            ?mode,
            function_type = descriptor.function_type.as_str_name(),
            params = descriptor.params.len(),
            "EvaluateScript called"
        );

        let (response_tx, response) = self.response(&guard);
        let worker = ScriptWorker::spawn(engine, script);
        let input = row_batches(request.into_inner());
        let call = script::evaluate(
            descriptor,
            mode,
            worker,
            input,
            response_tx.clone(),
            self.cancellation_token.clone(),
        );
        tokio::spawn(run_call(guard, response_tx, call));

        Ok(response)
    }
}

/// Runs one call to completion. The call's error, or a panic inside it, becomes the terminal
/// status of its response stream; the context guard is released in every case.
#[tracing::instrument(skip_all, fields(call_id = %guard.id()))]
async fn run_call<F>(guard: CallContextGuard, response_tx: ResponseSender, call: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    // A new task is spawned to catch the panic
    let result = match tokio::spawn(call).await {
        Ok(result) => result,
        Err(e) => Err(Error::ConnectorError(ErrorKind::InternalError(format!(
            "call task failed: {e}"
        )))),
    };

    match result {
        Ok(()) => debug!("Call completed"),
        Err(err) => {
            error!(error = %err, "Call failed");
            if response_tx.send(Err(err.into_status())).await.is_err() {
                debug!("Response stream closed, caller is gone");
            }
        }
    }
    drop(guard);
}

/// gRPC server hosting the connector service.
pub struct Server {
    config: ServerConfig,
    functions: FunctionTable,
    script_engine: Option<Arc<dyn ScriptEngine>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(FunctionTable::builtin())
    }
}

impl Server {
    pub fn new(functions: FunctionTable) -> Self {
        Self {
            config: ServerConfig::new(),
            functions,
            script_engine: None,
        }
    }

    /// Replace the whole server configuration.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the TCP address the gRPC server listens on. Default value is `0.0.0.0:50053`.
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.config = self.config.with_address(address);
        self
    }

    /// Set the unix domain socket file path used by the gRPC server to listen for incoming connections.
    pub fn with_socket_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.config = self.config.with_socket_file(file);
        self
    }

    /// Get where the gRPC server listens for incoming connections.
    pub fn listen(&self) -> &Listen {
        self.config.listen()
    }

    /// Set the maximum size of an encoded and decoded gRPC message. The value of `message_size` is in bytes. Default value is 64MB.
    pub fn with_max_message_size(mut self, message_size: usize) -> Self {
        self.config = self.config.with_max_message_size(message_size);
        self
    }

    /// Get the maximum size of an encoded and decoded gRPC message in bytes. Default value is 64MB.
    pub fn max_message_size(&self) -> usize {
        self.config.max_message_size()
    }

    pub fn with_plugin_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.config = self.config.with_plugin_identifier(identifier);
        self
    }

    pub fn plugin_identifier(&self) -> &str {
        self.config.plugin_identifier()
    }

    pub fn with_plugin_version(mut self, version: impl Into<String>) -> Self {
        self.config = self.config.with_plugin_version(version);
        self
    }

    pub fn plugin_version(&self) -> &str {
        self.config.plugin_version()
    }

    /// Enable `EvaluateScript` calls, evaluated by `engine`.
    pub fn with_script_engine(mut self, engine: impl ScriptEngine + 'static) -> Self {
        self.script_engine = Some(Arc::new(engine));
        self
    }

    /// Whether `EvaluateScript` calls are accepted.
    pub fn allow_script(&self) -> bool {
        self.script_engine.is_some()
    }

    /// Starts the gRPC server. When message is received on the `shutdown` channel, graceful shutdown of the gRPC server will be initiated.
    pub async fn start_with_shutdown(
        self,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.serve(Some(shutdown_rx)).await
    }

    /// Starts the gRPC server. Automatically registers signal handlers for SIGINT and SIGTERM and initiates graceful shutdown of gRPC server when either one of the signal arrives.
    pub async fn start(self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.serve(None).await
    }

    async fn serve(
        self,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Server {
            config,
            functions,
            script_engine,
        } = self;

        let cln_token = CancellationToken::new();
        info!(
            plugin_identifier = config.plugin_identifier(),
            plugin_version = config.plugin_version(),
            functions = functions.len(),
            allow_script = script_engine.is_some(),
            "Starting plugin server"
        );

        let connector_svc = ConnectorService {
            functions: Arc::new(functions),
            contexts: CallContextStore::new(),
            script_engine,
            plugin_identifier: config.plugin_identifier().to_string(),
            plugin_version: config.plugin_version().to_string(),
            cancellation_token: cln_token.clone(),
        };
        let connector_svc = connector_server::ConnectorServer::new(connector_svc)
            .max_encoding_message_size(config.max_message_size())
            .max_decoding_message_size(config.max_message_size());

        let router = tonic::transport::Server::builder().add_service(connector_svc);
        let shutdown = shared::shutdown_signal(shutdown_rx, cln_token);

        match config.listen() {
            Listen::Tcp(address) => {
                let listener = create_tcp_listener_stream(*address).await?;
                router
                    .serve_with_incoming_shutdown(listener, shutdown)
                    .await?;
            }
            Listen::Unix(socket_file) => {
                let _cleanup = SocketCleanup::new(socket_file.clone());
                let listener = create_unix_listener_stream(socket_file)?;
                router
                    .serve_with_incoming_shutdown(listener, shutdown)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::time::Duration;

    use prost::Message;
    use tempfile::TempDir;
    use tokio::net::UnixStream;
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::ReceiverStream;
    use tonic::metadata::MetadataValue;
    use tonic::transport::{Channel, Endpoint, Uri};
    use tonic::{Code, Request, Status, Streaming};
    use tower::service_fn;

    use super::{Server, run_call};
    use crate::cache_policy::{CACHE_HEADER, NO_STORE};
    use crate::context::CallContextStore;
    use crate::descriptor::{
        DataType, FUNCTION_REQUEST_HEADER, FunctionType, RequestDescriptor, SCRIPT_REQUEST_HEADER,
    };
    use crate::error::{self, ErrorKind};
    use crate::function::FunctionTable;
    use crate::proto::sse as proto;
    use crate::proto::sse::connector_client::ConnectorClient;
    use crate::script::BoaEngine;

    type TestResult = Result<(), Box<dyn Error>>;
    type ServerTask = JoinHandle<Result<(), Box<dyn Error + Send + Sync>>>;

    struct TestServer {
        _tmp_dir: TempDir,
        client: ConnectorClient<Channel>,
        shutdown_tx: oneshot::Sender<()>,
        task: ServerTask,
    }

    impl TestServer {
        async fn start(server: Server) -> Result<Self, Box<dyn Error>> {
            let tmp_dir = TempDir::new()?;
            let sock_file = tmp_dir.path().join("sse.sock");
            let server = server.with_socket_file(&sock_file).with_max_message_size(10240);
            assert_eq!(server.max_message_size(), 10240);

            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let task = tokio::spawn(async move { server.start_with_shutdown(shutdown_rx).await });

            tokio::time::sleep(Duration::from_millis(50)).await;

            // https://github.com/hyperium/tonic/blob/master/examples/src/uds/client.rs
            let channel = Endpoint::try_from("http://[::]:50051")?
                .connect_with_connector(service_fn(move |_: Uri| {
                    let sock_file = sock_file.clone();
                    async move {
                        Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(
                            UnixStream::connect(sock_file).await?,
                        ))
                    }
                }))
                .await?;

            Ok(Self {
                _tmp_dir: tmp_dir,
                client: ConnectorClient::new(channel),
                shutdown_tx,
                task,
            })
        }

        async fn stop(self) -> TestResult {
            let TestServer {
                _tmp_dir,
                client,
                shutdown_tx,
                task,
            } = self;
            drop(client);
            shutdown_tx
                .send(())
                .map_err(|_| "gRPC server stopped early")?;
            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .map_err(|_| "gRPC server is still running")??
                .map_err(|e| e.to_string())?;
            Ok(())
        }
    }

    fn numbers(values: &[f64]) -> proto::BundledRows {
        proto::BundledRows {
            rows: values
                .iter()
                .map(|v| proto::Row {
                    duals: vec![proto::Dual {
                        num_data: *v,
                        str_data: String::new(),
                    }],
                })
                .collect(),
        }
    }

    fn strings(values: &[&str]) -> proto::BundledRows {
        proto::BundledRows {
            rows: values
                .iter()
                .map(|v| proto::Row {
                    duals: vec![proto::Dual {
                        num_data: 0.0,
                        str_data: v.to_string(),
                    }],
                })
                .collect(),
        }
    }

    fn function_call<S>(function_id: i32, input: S) -> Request<S> {
        let header = proto::FunctionRequestHeader {
            function_id,
            version: "1.0.0".to_string(),
        };
        let mut request = Request::new(input);
        request.metadata_mut().insert_bin(
            FUNCTION_REQUEST_HEADER,
            MetadataValue::from_bytes(&header.encode_to_vec()),
        );
        request
    }

    fn script_call<S>(
        script: &str,
        function_type: FunctionType,
        return_type: DataType,
        params: &[DataType],
        input: S,
    ) -> Request<S> {
        let header = proto::ScriptRequestHeader {
            script: script.to_string(),
            function_type: function_type as i32,
            return_type: return_type as i32,
            params: params
                .iter()
                .enumerate()
                .map(|(i, data_type)| proto::Parameter {
                    data_type: *data_type as i32,
                    name: format!("p{i}"),
                })
                .collect(),
        };
        let mut request = Request::new(input);
        request.metadata_mut().insert_bin(
            SCRIPT_REQUEST_HEADER,
            MetadataValue::from_bytes(&header.encode_to_vec()),
        );
        request
    }

    async fn collect(
        mut stream: Streaming<proto::BundledRows>,
    ) -> Result<Vec<proto::BundledRows>, Status> {
        let mut out = Vec::new();
        while let Some(batch) = stream.message().await? {
            out.push(batch);
        }
        Ok(out)
    }

    fn nums(out: &[proto::BundledRows]) -> Vec<f64> {
        out.iter()
            .flat_map(|b| b.rows.iter().map(|r| r.duals[0].num_data))
            .collect()
    }

    fn strs(out: &[proto::BundledRows]) -> Vec<String> {
        out.iter()
            .flat_map(|b| b.rows.iter().map(|r| r.duals[0].str_data.clone()))
            .collect()
    }

    #[tokio::test]
    async fn get_capabilities() -> TestResult {
        let server = Server::default()
            .with_plugin_identifier("Rust SSE test")
            .with_plugin_version("v0.0.1")
            .with_script_engine(BoaEngine::default());
        assert!(server.allow_script());
        assert_eq!(server.plugin_identifier(), "Rust SSE test");
        let mut server = TestServer::start(server).await?;

        let caps = server
            .client
            .get_capabilities(proto::Empty {})
            .await?
            .into_inner();
        assert!(caps.allow_script);
        assert_eq!(caps.plugin_identifier, "Rust SSE test");
        assert_eq!(caps.plugin_version, "v0.0.1");
        let names: Vec<&str> = caps.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "HelloWorld",
                "SumOfRows",
                "SumOfColumn",
                "StringAggregation",
                "Cache",
                "NoCache"
            ]
        );

        server.stop().await
    }

    #[tokio::test]
    async fn aggregation_over_several_batches() -> TestResult {
        let mut server = TestServer::start(Server::default()).await?;

        let input = tokio_stream::iter(vec![numbers(&[1.0]), numbers(&[]), numbers(&[2.0, 3.0])]);
        let response = server.client.execute_function(function_call(2, input)).await?;
        assert!(response.metadata().get(CACHE_HEADER).is_none());
        let out = collect(response.into_inner()).await?;
        assert_eq!(out.len(), 1);
        assert_eq!(nums(&out), vec![6.0]);

        let input = tokio_stream::iter(vec![strings(&["a"]), strings(&["b", "c"])]);
        let response = server.client.execute_function(function_call(3, input)).await?;
        assert_eq!(strs(&collect(response.into_inner()).await?), vec!["abc"]);

        let input = tokio_stream::iter(Vec::<proto::BundledRows>::new());
        let response = server.client.execute_function(function_call(3, input)).await?;
        assert_eq!(strs(&collect(response.into_inner()).await?), vec![""]);

        server.stop().await
    }

    #[tokio::test]
    async fn scalar_and_tensor_keep_row_order() -> TestResult {
        let mut server = TestServer::start(Server::default()).await?;

        let input = tokio_stream::iter(vec![strings(&["a", "b"]), strings(&["c"])]);
        let response = server.client.execute_function(function_call(0, input)).await?;
        let out = collect(response.into_inner()).await?;
        assert_eq!(out.len(), 3);
        assert_eq!(strs(&out), vec!["a", "b", "c"]);

        let input = tokio_stream::iter(vec![strings(&["x", "y"]), strings(&["z"])]);
        let response = server.client.execute_function(function_call(4, input)).await?;
        let out = collect(response.into_inner()).await?;
        assert_eq!(out.len(), 2);
        let stamped = strs(&out);
        assert!(stamped[0].starts_with("x___"));
        assert!(stamped[1].starts_with("y___"));
        assert!(stamped[2].starts_with("z___"));

        server.stop().await
    }

    #[tokio::test]
    async fn only_no_cache_function_is_marked_no_store() -> TestResult {
        let mut server = TestServer::start(Server::default()).await?;

        for function_id in 0..6 {
            let input = tokio_stream::iter(vec![strings(&["a"])]);
            let response = server
                .client
                .execute_function(function_call(function_id, input))
                .await?;
            let header = response
                .metadata()
                .get(CACHE_HEADER)
                .map(|v| v.to_str().map(str::to_string))
                .transpose()?;
            if function_id == 5 {
                assert_eq!(header.as_deref(), Some(NO_STORE));
            } else {
                assert_eq!(header, None, "function {function_id} must be cacheable");
            }
            // SumOfRows needs two columns, so it fails; the header is decided regardless.
            let _ = collect(response.into_inner()).await;
        }

        server.stop().await
    }

    #[tokio::test]
    async fn header_errors_fail_only_the_call() -> TestResult {
        let mut server = TestServer::start(Server::default()).await?;

        let input = tokio_stream::iter(vec![numbers(&[1.0])]);
        let err = server
            .client
            .execute_function(Request::new(input))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let mut request = Request::new(tokio_stream::iter(vec![numbers(&[1.0])]));
        request.metadata_mut().insert_bin(
            FUNCTION_REQUEST_HEADER,
            MetadataValue::from_bytes(&[0xff, 0xff, 0xff]),
        );
        let err = server.client.execute_function(request).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let input = tokio_stream::iter(vec![numbers(&[1.0])]);
        let err = server
            .client
            .execute_function(function_call(42, input))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        // the server keeps serving
        let input = tokio_stream::iter(vec![numbers(&[1.0, 2.0, 3.0])]);
        let response = server.client.execute_function(function_call(2, input)).await?;
        assert_eq!(nums(&collect(response.into_inner()).await?), vec![6.0]);

        server.stop().await
    }

    #[tokio::test]
    async fn validation_error_ends_the_stream() -> TestResult {
        let mut server = TestServer::start(Server::default()).await?;

        let input = tokio_stream::iter(vec![numbers(&[1.0])]);
        let response = server.client.execute_function(function_call(1, input)).await?;
        let mut stream = response.into_inner();
        let err = stream.message().await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        server.stop().await
    }

    #[tokio::test]
    async fn concurrent_calls_are_isolated() -> TestResult {
        let mut server = TestServer::start(Server::default()).await?;

        let (sum_tx, sum_rx) = mpsc::channel(4);
        let (concat_tx, concat_rx) = mpsc::channel(4);

        let mut sum_client = server.client.clone();
        let sum_call = tokio::spawn(async move {
            let response = sum_client
                .execute_function(function_call(2, ReceiverStream::new(sum_rx)))
                .await?;
            collect(response.into_inner()).await
        });
        let mut concat_client = server.client.clone();
        let concat_call = tokio::spawn(async move {
            let response = concat_client
                .execute_function(function_call(3, ReceiverStream::new(concat_rx)))
                .await?;
            collect(response.into_inner()).await
        });

        sum_tx.send(numbers(&[1.0, 2.0])).await?;
        concat_tx.send(strings(&["x"])).await?;
        sum_tx.send(numbers(&[3.0])).await?;
        concat_tx.send(strings(&["y", "z"])).await?;
        drop(sum_tx);
        drop(concat_tx);

        assert_eq!(nums(&sum_call.await??), vec![6.0]);
        assert_eq!(strs(&concat_call.await??), vec!["xyz"]);

        server.stop().await
    }

    #[tokio::test]
    async fn evaluate_script_modes() -> TestResult {
        let mut server =
            TestServer::start(Server::default().with_script_engine(BoaEngine::default())).await?;

        // one evaluation per row, no cache header
        let input = tokio_stream::iter(vec![numbers(&[1.0, 2.0]), numbers(&[3.5])]);
        let request = script_call(
            "args[0] * 2",
            FunctionType::Scalar,
            DataType::Numeric,
            &[DataType::Numeric],
            input,
        );
        let response = server.client.evaluate_script(request).await?;
        assert!(response.metadata().get(CACHE_HEADER).is_none());
        let out = collect(response.into_inner()).await?;
        assert_eq!(out.len(), 2);
        assert_eq!(nums(&out), vec![2.0, 4.0, 7.0]);

        // parameterless script is evaluated once
        let input = tokio_stream::iter(Vec::<proto::BundledRows>::new());
        let request = script_call("'a' + 'b'", FunctionType::Tensor, DataType::String, &[], input);
        let response = server.client.evaluate_script(request).await?;
        assert_eq!(strs(&collect(response.into_inner()).await?), vec!["ab"]);

        // aggregation over columns
        let input = tokio_stream::iter(vec![strings(&["a"]), strings(&["b", "c"])]);
        let request = script_call(
            "args[0].join('-')",
            FunctionType::Aggregation,
            DataType::String,
            &[DataType::String],
            input,
        );
        let response = server.client.evaluate_script(request).await?;
        let out = collect(response.into_inner()).await?;
        assert_eq!(out.len(), 1);
        assert_eq!(strs(&out), vec!["a-b-c"]);

        // dual return type carries both representations
        let input = tokio_stream::iter(vec![numbers(&[4.0])]);
        let request = script_call(
            "args[0] + 0.5",
            FunctionType::Scalar,
            DataType::Dual,
            &[DataType::Numeric],
            input,
        );
        let response = server.client.evaluate_script(request).await?;
        let out = collect(response.into_inner()).await?;
        assert_eq!(out[0].rows[0].duals[0].num_data, 4.5);
        assert_eq!(out[0].rows[0].duals[0].str_data, "4.5");

        server.stop().await
    }

    #[tokio::test]
    async fn evaluate_script_errors() -> TestResult {
        let mut server =
            TestServer::start(Server::default().with_script_engine(BoaEngine::default())).await?;

        // parameterless aggregation is rejected before anything runs
        let input = tokio_stream::iter(vec![numbers(&[1.0])]);
        let request = script_call(
            "1",
            FunctionType::Aggregation,
            DataType::Numeric,
            &[],
            input,
        );
        let err = server.client.evaluate_script(request).await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        // non-numeric result for a numeric return type, nothing is sent before the error
        let input = tokio_stream::iter(vec![numbers(&[1.0, 2.0])]);
        let request = script_call(
            "'abc'",
            FunctionType::Scalar,
            DataType::Numeric,
            &[DataType::Numeric],
            input,
        );
        let response = server.client.evaluate_script(request).await?;
        let mut stream = response.into_inner();
        let err = stream.message().await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        // a later batch failing discards the rows of the batches before it
        let input = tokio_stream::iter(vec![strings(&["1"]), strings(&["abc"])]);
        let request = script_call(
            "args[0]",
            FunctionType::Scalar,
            DataType::Numeric,
            &[DataType::String],
            input,
        );
        let response = server.client.evaluate_script(request).await?;
        let mut stream = response.into_inner();
        let err = stream.message().await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        // script exception
        let input = tokio_stream::iter(vec![numbers(&[1.0])]);
        let request = script_call(
            "throw new Error('nope')",
            FunctionType::Scalar,
            DataType::String,
            &[DataType::Numeric],
            input,
        );
        let response = server.client.evaluate_script(request).await?;
        let err = collect(response.into_inner()).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        // unknown return type
        let header = proto::ScriptRequestHeader {
            script: "1".to_string(),
            function_type: FunctionType::Scalar as i32,
            return_type: 9,
            params: vec![],
        };
        let mut request = Request::new(tokio_stream::iter(Vec::<proto::BundledRows>::new()));
        request.metadata_mut().insert_bin(
            SCRIPT_REQUEST_HEADER,
            MetadataValue::from_bytes(&header.encode_to_vec()),
        );
        let err = server.client.evaluate_script(request).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        server.stop().await
    }

    #[tokio::test]
    async fn scripts_disabled_without_engine() -> TestResult {
        let mut server = TestServer::start(Server::default()).await?;

        let caps = server
            .client
            .get_capabilities(proto::Empty {})
            .await?
            .into_inner();
        assert!(!caps.allow_script);

        let input = tokio_stream::iter(vec![numbers(&[1.0])]);
        let request = script_call(
            "args[0]",
            FunctionType::Scalar,
            DataType::Numeric,
            &[DataType::Numeric],
            input,
        );
        let err = server.client.evaluate_script(request).await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        server.stop().await
    }

    fn descriptor() -> RequestDescriptor {
        FunctionTable::builtin().resolve(0).unwrap().descriptor()
    }

    #[tokio::test]
    async fn failed_call_releases_context() {
        let contexts = CallContextStore::new();
        let guard = contexts.open(descriptor());
        let (tx, mut rx) = mpsc::channel(1);

        run_call(guard, tx, async {
            Err(error::Error::FunctionError(ErrorKind::ValidationError(
                "short row".to_string(),
            )))
        })
        .await;

        let status = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(contexts.is_empty());
    }

    #[tokio::test]
    async fn failed_call_with_caller_gone_releases_context() {
        let contexts = CallContextStore::new();
        let guard = contexts.open(descriptor());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        run_call(guard, tx, async {
            Err(error::Error::FunctionError(ErrorKind::ValidationError(
                "short row".to_string(),
            )))
        })
        .await;

        assert!(contexts.is_empty());
    }

    #[tokio::test]
    async fn panicking_call_is_an_internal_error() {
        let contexts = CallContextStore::new();
        let guard = contexts.open(descriptor());
        let (tx, mut rx) = mpsc::channel(1);

        run_call(guard, tx, async { panic!("function panicked") }).await;

        let status = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert!(contexts.is_empty());
    }
}
