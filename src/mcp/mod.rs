//! MCP 远程工具：stdio JSON-RPC 客户端、线协议类型、Tool 适配

pub mod client;
pub mod protocol;
pub mod tool;

pub use client::McpClient;
pub use protocol::{CallToolResult, ContentItem};
pub use tool::{register_mcp_tools, McpTool};
