use std::{env, path::PathBuf, time::Duration};

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::mcp::endpoint::{
    EndpointConfig, HandshakeFrame, InvocationMode, ServerInfo, DEFAULT_PROTOCOL_VERSION,
    DEFAULT_SHUTDOWN_METHOD,
};
use crate::mcp::framer::DEFAULT_MAX_FRAME_BYTES;
use crate::mcp::message::RequestId;

pub const DEFAULT_ECHO_TEXT: &str = "Hello from simple MCP!";

#[derive(Debug, Clone)]
pub struct Config {
    pub protocol_version: String,
    pub server_name: String,
    pub server_version: String,
    pub capabilities: Map<String, Value>,
    pub echo_text: String,
    pub drain_timeout: Option<Duration>,
    pub concurrent: bool,
    pub allow_override: bool,
    pub shutdown_method: Option<String>,
    pub handshake: HandshakeFrame,
    pub max_frame_bytes: usize,
    pub event_log_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_PROTOCOL_VERSION must not be empty")]
    EmptyProtocolVersion,
    #[error("MCP_CAPABILITIES must be a JSON object")]
    InvalidCapabilities,
    #[error("MCP_DRAIN_TIMEOUT_MS must be a non-negative integer")]
    InvalidDrainTimeout,
    #[error("{0} must be one of: true, false, 1, 0, yes, no")]
    InvalidBool(&'static str),
    #[error("MCP_HANDSHAKE_ID must not be empty")]
    InvalidHandshakeId,
    #[error("MCP_MAX_FRAME_BYTES must be a positive integer")]
    InvalidMaxFrameBytes,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset and blank values
    /// fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let protocol_version = match lookup("MCP_PROTOCOL_VERSION") {
            Some(value) if value.trim().is_empty() => {
                return Err(ConfigError::EmptyProtocolVersion)
            }
            Some(value) => value.trim().to_string(),
            None => DEFAULT_PROTOCOL_VERSION.to_string(),
        };

        let capabilities = match var("MCP_CAPABILITIES") {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => return Err(ConfigError::InvalidCapabilities),
            },
            None => default_capabilities(),
        };

        let drain_timeout = var("MCP_DRAIN_TIMEOUT_MS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| ConfigError::InvalidDrainTimeout)
            })
            .transpose()?;

        let shutdown_method = match lookup("MCP_SHUTDOWN_METHOD") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value.trim().to_string()),
            None => Some(DEFAULT_SHUTDOWN_METHOD.to_string()),
        };

        let handshake = match var("MCP_HANDSHAKE_NOTIFICATION") {
            Some(method) => HandshakeFrame::Notification(method),
            None => match lookup("MCP_HANDSHAKE_ID") {
                Some(value) if value.trim().is_empty() => {
                    return Err(ConfigError::InvalidHandshakeId)
                }
                Some(value) => HandshakeFrame::Response(parse_request_id(value.trim())),
                None => HandshakeFrame::Response(RequestId::Integer(1)),
            },
        };

        let max_frame_bytes = var("MCP_MAX_FRAME_BYTES")
            .map(|value| {
                value
                    .parse::<usize>()
                    .ok()
                    .filter(|bytes| *bytes > 0)
                    .ok_or(ConfigError::InvalidMaxFrameBytes)
            })
            .transpose()?
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        Ok(Self {
            protocol_version,
            server_name: var("MCP_SERVER_NAME")
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            server_version: var("MCP_SERVER_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            capabilities,
            echo_text: lookup("MCP_ECHO_TEXT").unwrap_or_else(|| DEFAULT_ECHO_TEXT.to_string()),
            drain_timeout,
            concurrent: parse_bool("MCP_CONCURRENT", var("MCP_CONCURRENT"), false)?,
            allow_override: parse_bool("MCP_ALLOW_OVERRIDE", var("MCP_ALLOW_OVERRIDE"), true)?,
            shutdown_method,
            handshake,
            max_frame_bytes,
            event_log_path: var("MCP_EVENT_LOG").map(PathBuf::from),
        })
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            protocol_version: self.protocol_version.clone(),
            capabilities: self.capabilities.clone(),
            server_info: ServerInfo {
                name: self.server_name.clone(),
                version: self.server_version.clone(),
            },
            handshake: self.handshake.clone(),
            drain_timeout: self.drain_timeout,
            mode: if self.concurrent {
                InvocationMode::Concurrent
            } else {
                InvocationMode::Serial
            },
            shutdown_method: self.shutdown_method.clone(),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

fn default_capabilities() -> Map<String, Value> {
    Map::from_iter([
        ("tools".to_string(), json!({})),
        ("logging".to_string(), json!({})),
    ])
}

fn parse_request_id(value: &str) -> RequestId {
    value
        .parse::<u64>()
        .map(RequestId::from)
        .or_else(|_| value.parse::<i64>().map(RequestId::Integer))
        .unwrap_or_else(|_| RequestId::String(value.to_string()))
}

fn parse_bool(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value.map(|value| value.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(_) => Err(ConfigError::InvalidBool(key)),
    }
}
