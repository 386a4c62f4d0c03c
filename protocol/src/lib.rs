//! Shared data model for the Tether orchestration core.
//!
//! Everything in this crate is plain serializable data: the session and
//! message records the services persist, the event payloads the brokers fan
//! out, and the small enums shared between the config layer and the
//! supervisors. No I/O happens here.

pub mod config_types;
pub mod models;
pub mod protocol;

pub use models::ContentPart;
pub use models::Message;
pub use models::Role;
pub use models::Session;
pub use models::TokenUsage;
pub use protocol::AgentEvent;
pub use protocol::AgentEventKind;
pub use protocol::CreatePermissionRequest;
pub use protocol::LspEvent;
pub use protocol::LspState;
pub use protocol::McpClientInfo;
pub use protocol::McpEvent;
pub use protocol::McpState;
pub use protocol::PermissionNotification;
pub use protocol::PermissionRequest;
