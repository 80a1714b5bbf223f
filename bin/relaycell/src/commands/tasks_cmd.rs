use relaycell_storage::{Task, TaskStatus};

use super::Env;

fn short(id: &str) -> String {
    id.chars().take(12).collect()
}

fn describe(task: &Task) -> String {
    let icon = match task.status {
        TaskStatus::Pending if task.pending_delegations > 0 => "⏳",
        TaskStatus::Pending => "🔄",
        TaskStatus::Cancelled => "🚫",
    };
    let parent = task
        .parent_task_id
        .as_deref()
        .map(|p| format!(" ← {}", short(p)))
        .unwrap_or_default();
    format!(
        "{} [{}] {} → {} ({}, waiting on {}){}",
        icon,
        short(&task.task_id),
        task.requester,
        task.delegated_to,
        task.status.as_str(),
        task.pending_delegations,
        parent
    )
}

/// Finished tasks are deleted, so everything listed here is still open or
/// was cancelled.
pub fn list(env: &Env) -> anyhow::Result<()> {
    let store = env.open_store()?;
    let tasks = store.list_tasks()?;

    if tasks.is_empty() {
        println!();
        println!("📋 No unfinished tasks.");
        println!();
        return Ok(());
    }

    println!();
    println!("📋 Tasks ({} total)", tasks.len());
    println!();
    for task in &tasks {
        println!("  {}", describe(task));
        let preview: String = task.original_request.chars().take(120).collect();
        println!("     Request: {}", preview);
        println!("     Channel: {}  Context: {}", task.requester_channel, task.context_id);
        for record in &task.delegation_context.delegations {
            let state = if record.is_completed() { "done" } else { "open" };
            println!("     ↳ {} {} ({})", state, record.agent, short(&record.child_task_id));
        }
        println!("     Created: {}", task.created_at);
        println!();
    }
    Ok(())
}
