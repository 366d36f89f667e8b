//! # Duplex RPC Runtime
//!
//! Runtime for the duplex-rpc protocol engine.
//!
//! ## Core Components
//!
//! - **Session**: correlation core. Multiplexes outbound requests over one
//!   connection, dispatches inbound requests to handlers and propagates
//!   cancellation both ways
//! - **Task engine**: durable, pollable, cancellable units of work whose
//!   queued messages reach the caller across reconnects
//! - **Event log**: in-memory resumable log for streaming transports
//!
//! ## Example
//!
//! ```no_run
//! use duplex_rpc_core::transport::Connection;
//! use duplex_rpc_runtime::config::{SessionConfig, TaskEngineConfig};
//! use duplex_rpc_runtime::session::{HandlerRegistry, Session};
//! use duplex_rpc_runtime::tasks::{TaskEngine, register_task_methods};
//!
//! # async fn serve(connection: Connection) {
//! let engine = TaskEngine::in_memory(TaskEngineConfig::default());
//! let _reaper = engine.spawn_reaper(std::time::Duration::from_secs(30));
//!
//! let mut registry = HandlerRegistry::new();
//! register_task_methods(&mut registry, &engine);
//!
//! let session = Session::start(connection, registry, SessionConfig::default());
//! let exit = session.closed().await;
//! tracing::info!(?exit, "Peer gone");
//! # }
//! ```

/// Session and task engine configuration
pub mod config;

/// In-memory resumable event log
pub mod event_log;

/// Metric names for the `metrics` facade
pub mod metrics;

/// Correlation core
pub mod session;

/// Asynchronous task engine
pub mod tasks;

pub use config::{ConfigError, SessionConfig, TaskEngineConfig};
pub use event_log::{InMemoryEventLog, StreamRecorder};
pub use session::{HandlerRegistry, RequestContext, RequestOptions, Session, SessionExit};
pub use tasks::{TaskClient, TaskEngine, TaskHandle, register_task_methods};
