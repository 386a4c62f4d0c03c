mod mcp_client;

pub use mcp_client::McpClient;
pub use mcp_client::create_env_for_mcp_server;
