//! Framed JSON-RPC client engine for the Quill assistant CLI.
//!
//! This crate provides:
//! - Content-Length framed transport over a subprocess's stdio pipes or a
//!   TCP socket
//! - Request/response correlation with monotonically increasing ids
//! - Dispatch of server-initiated calls through a method-handler registry
//! - The JSON-RPC 2.0 envelope types and reserved error codes
//!
//! Both peers can initiate calls: the client issues requests through
//! [`RpcClient::invoke`], and the server calls back into the client through
//! handlers registered with [`RpcClient::register_method_handler`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{MethodHandler, RpcClient, method_handler};
pub use error::{HandlerError, RpcError, RpcResult};
pub use protocol::{
    ErrorObject, IncomingMessage, OutgoingNotification, OutgoingRequest, OutgoingResponse,
    RequestId,
};
