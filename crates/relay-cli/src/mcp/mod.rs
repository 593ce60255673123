//! MCP (Model Context Protocol) tool-server support
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │               ServerConnectionManager                   │
//! │  - One slot per registered server                       │
//! │  - Serializes connects per server                       │
//! │  - Health checks, summaries                             │
//! └─────────────────┬───────────────────────────────────────┘
//!                   │ TransportNegotiator
//!          ┌────────┴────────┬─────────────────┐
//!          ▼                 ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │ StreamableHttp  │ │  Sse (legacy)   │ │  Stdio (launch) │
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//! ```
//!
//! [`ToolCatalog`] exposes the tools of every connected server to the model
//! under encoded names (`<server>__mcp__<tool>`).
//!
//! # Configuration
//!
//! ```toml
//! [servers.weather-server]
//! url = "http://localhost:7001/weatherServer"
//! command = "node"
//! args = ["./dist/mcpServers/WeatherServer.js"]
//!
//! [servers.github]
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-github"]
//! env = { GITHUB_TOKEN = "${GITHUB_TOKEN}" }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod tools;
pub mod transport;

pub use client::{CallToolResult, McpClient, McpPrompt, McpResource, McpToolInfo};
pub use config::{ServerDescriptor, ServerRegistry};
pub use error::{ConnectAttempt, McpError};
pub use lifecycle::{ConnectPreference, ServerConnectionManager, ServerState, ServerSummary, TransportNegotiator};
pub use tools::{decode_tool_name, encode_tool_name, render_result, ToolCatalog, ToolDescriptor, TOOL_NAME_DELIMITER};
pub use transport::{DefaultTransportFactory, McpTransport, TransportFactory, TransportKind};
