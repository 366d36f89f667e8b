//! Task round trip
//!
//! Two peers share an in-memory connection. The server runs `tools/call` as
//! a task that streams log lines and asks the client for confirmation
//! half-way through; the client polls until the task finishes and then
//! fetches its result.

use duplex_rpc_core::error::HandlerError;
use duplex_rpc_core::methods;
use duplex_rpc_core::task::{Task, TaskMetadata};
use duplex_rpc_runtime::config::{SessionConfig, TaskEngineConfig};
use duplex_rpc_runtime::session::{HandlerRegistry, Session};
use duplex_rpc_runtime::tasks::{TaskClient, TaskEngine, TaskHandle, register_task_methods};
use duplex_rpc_testing::memory;
use serde_json::{Value, json};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn long_report(task: TaskHandle, topic: String) -> Result<Value, HandlerError> {
    task.set_working(Some(format!("Collecting sources on {topic}"))).await?;
    for step in 1..=3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.notify("log", Some(json!({"line": format!("step {step}/3 done")})))
            .await?;
    }

    let answer = task
        .request("confirm", Some(json!({"question": format!("Publish the report on {topic}?")})))
        .await?;
    if answer["approved"] != json!(true) {
        return Err(HandlerError::internal("Publication declined"));
    }
    Ok(json!({"report": format!("{topic}: 3 sections"), "published": true}))
}

fn server_registry(engine: &TaskEngine) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_task_methods(&mut registry, engine);
    registry.on_request("ping", |_cx| async { Ok(json!("pong")) });

    let engine = engine.clone();
    registry.on_request("tools/call", move |cx| {
        let engine = engine.clone();
        async move {
            let topic = cx
                .raw_params()
                .and_then(|params| params["topic"].as_str())
                .unwrap_or("nothing")
                .to_string();
            let metadata = TaskMetadata::from_params(cx.raw_params())?;
            engine
                .run_task(&cx, metadata, move |task| long_report(task, topic))
                .await
        }
    });
    registry
}

fn client_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.on_notification("log", |cx| async move {
        if let Some(line) = cx.raw_params().and_then(|params| params["line"].as_str()) {
            println!("  [server] {line}");
        }
    });
    registry.on_notification(methods::TASK_STATUS, |cx| async move {
        if let Ok(task) = cx.params::<Task>() {
            println!("  [status] {} -> {}", task.task_id, task.status);
        }
    });
    registry.on_request("confirm", |cx| async move {
        let question = cx
            .raw_params()
            .and_then(|params| params["question"].as_str())
            .unwrap_or_default()
            .to_string();
        println!("  [client] {question} yes");
        Ok(json!({"approved": true}))
    });
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "task_roundtrip=info,duplex_rpc_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    duplex_rpc_runtime::metrics::describe_metrics();

    println!("=== Task Round Trip ===\n");

    let engine = TaskEngine::in_memory(
        TaskEngineConfig::from_env()?.with_poll_interval(Duration::from_millis(50)),
    );
    let reaper = engine.spawn_reaper(Duration::from_secs(30));

    let (client_end, server_end) = memory::pair(64);
    let server = Session::start(server_end, server_registry(&engine), SessionConfig::default());
    let client = Session::start(client_end, client_registry(), SessionConfig::default());

    let pong: String = client.request("ping", &json!({})).await?;
    println!(">>> ping -> {pong}\n");

    let tasks = TaskClient::new(client.clone());
    let task = tasks
        .start(
            "tools/call",
            json!({"topic": "tide tables"}),
            TaskMetadata { ttl: Some(60_000) },
        )
        .await?;
    println!(">>> Started task {} ({})", task.task_id, task.status);

    let done = tasks.poll_until_terminal(&task.task_id).await?;
    println!("\n>>> Task finished: {}", done.status);

    let result: Value = tasks.get_task_result(&task.task_id).await?;
    println!(">>> Result: {result}");

    let page = tasks.list_tasks(None).await?;
    println!(">>> {} task(s) on record", page.tasks.len());

    client.close();
    let exit = server.closed().await;
    tracing::info!(?exit, "Server session ended");
    reaper.abort();

    println!("\n=== Done ===");
    Ok(())
}
