//! Transports to external tool servers.
//!
//! A transport owns the wire: it drains the correlator's outbound queue and
//! feeds inbound responses back through [`crate::rpc::Correlator::dispatch`]. When the
//! wire goes away it rejects everything still pending.

pub mod client;
pub mod env;
pub mod http;
pub mod stdio;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConduitError, Result};

pub use client::{ClientTimeouts, ConnectionState, ToolClient, ToolDescriptor, ToolOutput};
pub use env::{DEFAULT_DENIED_VARS, EnvPolicy};
pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// How to reach a tool server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn a local process and talk over its standard streams
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// POST requests to a URL and read streamed responses
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::Stdio {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
        }
    }

    /// Short human-readable target
    pub fn target(&self) -> String {
        match self {
            Self::Stdio { command, args, .. } if args.is_empty() => command.clone(),
            Self::Stdio { command, args, .. } => format!("{} {}", command, args.join(" ")),
            Self::Http { url, .. } => url.clone(),
        }
    }

    /// Check the fields each kind requires
    pub fn validate(&self, name: &str) -> Result<()> {
        match self {
            Self::Stdio { command, .. } if command.trim().is_empty() => Err(ConduitError::Config(format!(
                "server '{}': stdio transport requires a command",
                name
            ))),
            Self::Http { url, .. } if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(ConduitError::Config(format!(
                    "server '{}': http transport requires an http(s) url, got '{}'",
                    name, url
                )))
            }
            _ => Ok(()),
        }
    }
}

/// An established connection to a tool server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Tear the connection down and reject pending requests. Idempotent.
    async fn close(&self);

    /// False once the remote end went away or `close` was called
    fn is_open(&self) -> bool;

    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_config_from_yaml() {
        let yaml = r#"
kind: stdio
command: npx
args: ["-y", "some-server"]
env:
  ROOT: /tmp
"#;
        let config: TransportConfig = serde_yaml::from_str(yaml).unwrap();
        match &config {
            TransportConfig::Stdio { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
                assert_eq!(env.get("ROOT").map(String::as_str), Some("/tmp"));
            }
            other => panic!("unexpected config: {:?}", other),
        }
        assert_eq!(config.kind(), "stdio");
        assert_eq!(config.target(), "npx -y some-server");
        assert!(config.validate("files").is_ok());
    }

    #[test]
    fn test_http_config_from_yaml() {
        let yaml = r#"
kind: http
url: https://example.com/mcp
headers:
  Authorization: Bearer x
"#;
        let config: TransportConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.kind(), "http");
        assert_eq!(config.target(), "https://example.com/mcp");
        assert!(config.validate("remote").is_ok());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let yaml = "kind: websocket\nurl: ws://x\n";
        assert!(serde_yaml::from_str::<TransportConfig>(yaml).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let config = TransportConfig::stdio("  ", vec![]);
        let err = config.validate("broken").unwrap_err();
        assert!(matches!(err, ConduitError::Config(_)));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let config = TransportConfig::http("ftp://example.com");
        assert!(config.validate("remote").is_err());
    }
}
