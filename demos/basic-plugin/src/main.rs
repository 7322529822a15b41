use std::net::SocketAddr;

use sse::descriptor::{DataType, Param};
use sse::error::Error;
use sse::{BoaEngine, Dual, FunctionTable, RegisteredFunction, Row, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let functions = FunctionTable::builtin().register(RegisteredFunction::scalar(
        6,
        "Multiply",
        DataType::Numeric,
        vec![
            Param::new("value", DataType::Numeric),
            Param::new("factor", DataType::Numeric),
        ],
        multiply,
    ));

    let mut server = Server::new(functions)
        .with_plugin_identifier("Basic Rust plugin")
        .with_script_engine(BoaEngine::default());
    if let Ok(address) = std::env::var("SSE_PLUGIN_ADDR") {
        server = server.with_address(address.parse::<SocketAddr>()?);
    }
    server.start().await
}

fn multiply(row: &Row) -> Result<Row, Error> {
    let product = row.column(0, "Multiply")?.num * row.column(1, "Multiply")?.num;
    Ok(Row::single(Dual::numeric(product)))
}
