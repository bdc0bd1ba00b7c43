/// Chatflow server entry point
///
/// Loads configuration from the environment and serves:
/// - Flow management API at /api/flows/*
/// - Transport inbound events at /api/events
/// - Execution control at /api/executions/*
/// - Health check at /healthz

use chatflow::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    start_server(config).await?;
    Ok(())
}
