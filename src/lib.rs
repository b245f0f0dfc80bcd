use std::{io, sync::Arc};

pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod mcp;

use config::Config;
use domain::tools::{EchoTool, ListTools, Ping};
use errors::DispatchError;
use logging::{EventLog, FileEventLog, TracingEventLog};
use mcp::{dispatcher::Dispatcher, endpoint::Endpoint};

pub fn build_dispatcher(
    config: &Config,
    event_log: Arc<dyn EventLog>,
) -> Result<Dispatcher, DispatchError> {
    let mut dispatcher = Dispatcher::new()
        .with_allow_override(config.allow_override)
        .with_event_log(event_log);
    dispatcher.register("tools/call", Arc::new(EchoTool::new(config.echo_text.clone())))?;
    dispatcher.register("tools/list", Arc::new(ListTools))?;
    dispatcher.register("ping", Arc::new(Ping))?;
    Ok(dispatcher)
}

pub fn build_endpoint(
    config: &Config,
    event_log: Arc<dyn EventLog>,
) -> Result<Endpoint, DispatchError> {
    let dispatcher = build_dispatcher(config, Arc::clone(&event_log))?;
    Ok(Endpoint::new(config.endpoint_config(), dispatcher, event_log))
}

/// The file sink when `MCP_EVENT_LOG` is set, tracing otherwise.
pub fn open_event_log(config: &Config) -> io::Result<Arc<dyn EventLog>> {
    match &config.event_log_path {
        Some(path) => Ok(Arc::new(FileEventLog::open(path)?)),
        None => Ok(Arc::new(TracingEventLog)),
    }
}
