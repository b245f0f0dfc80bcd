use mcp_echo_server::{build_endpoint, config::Config, logging, open_event_log};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let event_log = open_event_log(&config)?;
    let endpoint = build_endpoint(&config, event_log)?;

    info!(
        server_name = %config.server_name,
        protocol_version = %config.protocol_version,
        concurrent = config.concurrent,
        "server starting on stdio"
    );

    endpoint.run(tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
