//! Client SDK for driving the Quill assistant CLI.
//!
//! This crate provides:
//! - [`Client`] — spawns the assistant CLI (or connects to one over TCP) and
//!   owns the framed JSON-RPC connection
//! - [`Session`] — one logical conversation, with a closed/open guard over
//!   every mutating operation
//! - Typed session events with generic and type-filtered subscriptions under
//!   a configurable error policy
//! - Custom tool registration and the permission round-trip for
//!   server-initiated tool calls
//!
//! ```no_run
//! use quill_sdk::{Client, ClientOptions, MessageOptions, SessionConfig};
//!
//! # async fn example() -> quill_sdk::SdkResult<()> {
//! let client = Client::new(ClientOptions {
//!     cli_path: Some("quill".to_string()),
//!     ..ClientOptions::default()
//! });
//! client.start().await?;
//!
//! let session = client.create_session(SessionConfig::default()).await?;
//! let _subscription = session.on(|event| {
//!     println!("event: {}", event.kind().as_str());
//! })?;
//!
//! session.send(MessageOptions::new("Hello!")).await?;
//! session.close().await;
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod api;
pub mod client;
pub mod error;
pub mod events;
pub mod session;
pub mod tools;
pub mod types;

mod util;

pub use client::{Client, ClientOptions, ConnectionState};
pub use error::{SdkError, SdkResult};
pub use events::{EventDispatcher, EventErrorPolicy, EventKind, SessionEvent, Subscription};
pub use session::{Session, SessionState};
pub use tools::{
    ApproveAll, PermissionHandler, PermissionOutcome, PermissionRequest, ToolDefinition,
    ToolError, ToolHandler, ToolInvocation, ToolResultObject, ToolResultType, permission_handler,
};
pub use types::{MessageOptions, ResumeSessionConfig, SessionConfig};

pub use quill_rpc::{RpcClient, RpcError};
