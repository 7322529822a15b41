//! A Rust server-side extension (SSE) plugin for [Qlik]. The plugin serves the
//! `qlik.sse.Connector` gRPC service: it advertises its functions through `GetCapabilities`,
//! runs registered functions through `ExecuteFunction` and evaluates script text sent by the
//! engine through `EvaluateScript`.
//!
//! Functions follow one of three calling conventions ([Scalar], [Aggregation] and [Tensor]) and
//! are registered in a [FunctionTable]. Script evaluation is enabled by giving the [Server] a
//! [ScriptEngine](script::ScriptEngine); the bundled [BoaEngine] evaluates JavaScript.
//!
//! ```no_run
//! use sse::{BoaEngine, FunctionTable, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     Server::new(FunctionTable::builtin())
//!         .with_script_engine(BoaEngine::default())
//!         .start()
//!         .await
//! }
//! ```
//!
//! [Qlik]: https://github.com/qlik-oss/server-side-extension
//! [Scalar]: function::Convention::Scalar
//! [Aggregation]: function::Convention::Aggregation
//! [Tensor]: function::Convention::Tensor

/// server configuration, listeners and shutdown
mod shared;

/// generated protobuf and gRPC code
pub mod proto;

/// row data exchanged with the engine
pub mod rows;

/// decoding of the request headers carried in call metadata
pub mod descriptor;

/// per-call context shared by the request handler and the call's task
pub mod context;

/// function registry and dispatch of `ExecuteFunction` calls
pub mod function;

/// running states of the aggregation calling convention
pub mod aggregate;

/// script engines and evaluation of `EvaluateScript` calls
pub mod script;

/// the `qlik-cache` response header
pub mod cache_policy;

/// the capability listing
pub mod capabilities;

/// the gRPC service and server
pub mod connector;

// Error handling in the plugin server!
//
// Every error is scoped to the call that raised it. The server keeps serving other calls and
// new calls no matter how one call ends.
//
// Task Ordering and error propagation.
//
//      level-1               level-2               level-3
//
//                   +---> (handler) ---> (call task) ---> (function / script)
//                   |
// (gRPC Service) ---+---> (handler) ---> (call task) ---> (function / script)
//      ^            |
//      |            +---> (handler) ---> (call task) ---> (function / script)
//  (shutdown)
//      |
//   (user)
//
// Errors found while decoding the request header are returned by the handler (level-2) before
// any row is read, so the call fails with a status and no response stream.
// Errors raised while rows are processed (level-3) are returned to the call task, which sends
// them as the terminal status of the response stream and releases the call context. A panic at
// level-3 is caught by the call task and reported as an internal error.
//
// User can directly send shutdown request to the gRPC server, or send SIGINT/SIGTERM, which stops
// accepting new calls. Lastly the cancellation token is cancelled so that in-flight calls end with
// a cancelled status.

/// error module
pub mod error;

pub use connector::Server;
pub use function::{FunctionTable, RegisteredFunction};
pub use rows::{Dual, Row, RowBatch};
pub use script::BoaEngine;
pub use shared::{DEFAULT_PORT, Listen, ServerConfig};
