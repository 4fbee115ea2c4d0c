//! The Gatehouse gateway.
//!
//! Terminates authenticated client sessions (WebSocket RPC plus a small
//! HTTP surface), dispatches method calls, and enforces tenant isolation
//! over shared on-host resources. The hard rails:
//!
//! - every method call passes the [`authorize`](authorize::authorize)
//!   gate, whose tenant allow-list no scope can bypass;
//! - every tenant-scoped session key passes through the session-key
//!   scoping chokepoint before anything downstream sees it;
//! - broadcast fan-out never blocks on a slow consumer.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authorize;
pub mod connection;
pub mod dispatch;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod server;

pub use connection::{ConnectionHandle, ConnectionRecord, ConnectionRegistry, Role};
pub use dispatch::{Dispatcher, EventFrame, RequestFrame, Responder, ResponseFrame};
pub use server::{ConnectParams, Gateway, router, serve};
