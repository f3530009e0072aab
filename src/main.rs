use std::sync::Arc;
use std::time::Duration;

use agent_hive::logging;
use agent_hive::{
    ExecutionDelegate, ExecutionOutcome, OrchestratorConfig, Priority, SessionManager,
    SessionOptions, SleepRequest, TaskContext,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

/// Alice plans: every task is handed to debbie over synchronous mail
struct Planner;

#[async_trait]
impl ExecutionDelegate for Planner {
    async fn execute(&self, ctx: TaskContext) -> Result<ExecutionOutcome> {
        let goal = ctx.task.payload.as_str().unwrap_or("nothing").to_string();
        tracing::info!(agent_id = %ctx.agent_id, %goal, "Planning");
        let reply = ctx
            .mailer
            .send_mail_with_switch("debbie", "subtask", &goal, Duration::from_secs(5))
            .await?;
        Ok(ExecutionOutcome::complete(json!({ "goal": goal, "result": reply.body })))
    }
}

/// Debbie works: answers mail, needs one continuation, then naps
struct Worker;

#[async_trait]
impl ExecutionDelegate for Worker {
    async fn execute(&self, ctx: TaskContext) -> Result<ExecutionOutcome> {
        if ctx.task.parent_task_id.is_none() {
            let body = ctx.task.payload["body"].as_str().unwrap_or_default().to_string();
            tracing::info!(agent_id = %ctx.agent_id, from = ?ctx.mail_sender(), %body, "Working");
            return Ok(ExecutionOutcome::continuation("verify", json!({ "body": body })));
        }
        let body = ctx.task.payload["body"].as_str().unwrap_or_default();
        Ok(ExecutionOutcome::sleep(
            json!(format!("done: {body}")),
            SleepRequest::for_duration(Duration::from_secs(1)).with_event("alert"),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = logging::init_logging()?;

    tracing::info!("=== Agent Hive Demo Starting ===");

    let config = OrchestratorConfig::from_env()?;
    let manager = SessionManager::new(config, Arc::new(Planner))?;

    manager.create_session("alice")?;
    manager.create_session_with("debbie", SessionOptions::new().with_delegate(Arc::new(Worker)))?;

    let mut events = manager.subscribe();
    manager.enqueue_task("alice", json!("summarise the logs"), Priority::Normal)?;

    // Wait for alice's task to finish
    while let Ok(event) = events.recv().await {
        let done = matches!(
            &event,
            agent_hive::events::OrchestratorEvent::TaskCompleted { agent_id, .. } if agent_id == "alice"
        );
        if done {
            break;
        }
    }

    for info in manager.list_sessions() {
        tracing::info!(agent_id = %info.agent_id, state = %info.state, errors = info.error_count, "Session");
    }

    manager.broadcast_event("alert", json!({ "source": "demo" }))?;
    tokio::time::sleep(manager.config().tick_interval * 3).await;
    tracing::info!(state = %manager.get_session_state("debbie")?.state, "Debbie after alert");

    manager.save_session_state("debbie").await?;
    manager.shutdown().await;

    tracing::info!("=== Agent Hive Demo Shutting Down ===");
    Ok(())
}
