//! Asynchronous task engine.
//!
//! A task is a unit of work that outlives the request that started it. The
//! server answers a task-augmented request at once with a `{task}` snapshot
//! and keeps working; the caller polls with `tasks/get`, collects the
//! outcome with `tasks/result` and may cancel with `tasks/cancel`.
//!
//! While the work runs it can talk back to the caller through
//! [`TaskHandle`]: notifications and nested requests are queued per task and
//! delivered whenever the caller attaches, on whichever session it uses at
//! that time.
//!
//! # Example
//!
//! ```no_run
//! use duplex_rpc_core::task::TaskMetadata;
//! use duplex_rpc_runtime::config::TaskEngineConfig;
//! use duplex_rpc_runtime::session::HandlerRegistry;
//! use duplex_rpc_runtime::tasks::{TaskEngine, register_task_methods};
//! use serde_json::json;
//!
//! let engine = TaskEngine::in_memory(TaskEngineConfig::default());
//! let mut registry = HandlerRegistry::new();
//! register_task_methods(&mut registry, &engine);
//!
//! let tasks = engine.clone();
//! registry.on_request("tools/call", move |cx| {
//!     let engine = tasks.clone();
//!     async move {
//!         let metadata = TaskMetadata::from_params(cx.raw_params())?;
//!         engine
//!             .run_task(&cx, metadata, |task| async move {
//!                 task.set_working(None).await?;
//!                 let answer = task.request("confirm", Some(json!({"q": "go?"}))).await?;
//!                 Ok(json!({"confirmed": answer}))
//!             })
//!             .await
//!     }
//! });
//! ```

mod client;
mod engine;
mod handle;
mod methods;
mod store;

pub use client::TaskClient;
pub use engine::{TaskEngine, TaskWatcher};
pub use handle::TaskHandle;
pub use methods::register_task_methods;
pub use store::{InMemoryMessageQueue, InMemoryTaskStore};
