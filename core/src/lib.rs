//! # Duplex RPC Core
//!
//! Wire types and contracts for a bidirectional JSON-RPC protocol engine.
//!
//! Two symmetric peers exchange correlated requests, responses and
//! notifications over an ordered transport. Long-running calls become
//! *tasks* the caller polls, and streaming transports can replay what a
//! reconnecting peer missed.
//!
//! This crate holds everything both peers and every transport agree on:
//!
//! - [`envelope`] and [`codec`]: the four message shapes and their JSON form
//! - [`error`]: wire error objects, handler errors, outbound request errors
//! - [`task`] and [`task_store`]: the task data model and its persistence
//!   contracts
//! - [`stream`] and [`event_log`]: resumable stream identifiers and the
//!   event log contract
//! - [`transport`] and [`body`]: the connection contract and byte limits
//! - [`environment`]: injected dependencies such as the [`environment::Clock`]
//!
//! The session, the task engine and in-memory implementations live in
//! `duplex-rpc-runtime`.
//!
//! ## Example
//!
//! ```
//! use duplex_rpc_core::codec;
//! use duplex_rpc_core::envelope::Envelope;
//! use serde_json::json;
//!
//! let bytes = codec::encode(&Envelope::request(1, "tasks/list", Some(json!({})))).unwrap();
//! let back = codec::decode(&bytes).unwrap();
//! assert_eq!(back.method(), Some("tasks/list"));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod body;
pub mod codec;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod event_log;
pub mod methods;
pub mod stream;
pub mod task;
pub mod task_store;
pub mod transport;

pub use envelope::{Envelope, RequestId};
pub use error::{ErrorObject, HandlerError, RpcError};
