//! Command-backed task handlers.
//!
//! The CLI's bootstrap step: each `[[tasks]]` config entry becomes a
//! registered handler that runs an external command (typically the backing
//! `agent` process) and captures its exit status and output tail. Library
//! users can register arbitrary async handlers instead; nothing in the
//! dispatcher or worker pool depends on this module.

use serde_json::json;
use tracing::debug;

use pipehub_registry::{TaskContext, TaskOutput, TaskRegistry};
use pipehub_shared::config::TaskEntry;
use pipehub_shared::{PipehubError, Result, TaskParams};

/// Longest output tail captured into a task result.
const OUTPUT_TAIL_BYTES: usize = 2000;

/// Register one command-backed handler per config entry.
///
/// Fails with `DuplicateTask` when two entries share a name.
pub fn register_command_tasks(registry: &mut TaskRegistry, entries: &[TaskEntry]) -> Result<()> {
    for entry in entries {
        let command = entry.command.clone();
        let args = entry.args.clone();
        registry.register(entry.name.clone(), TaskParams::new(), move |ctx| {
            let command = command.clone();
            let args = args.clone();
            async move { run_command(command, args, ctx).await }
        })?;
    }
    Ok(())
}

async fn run_command(command: String, args: Vec<String>, ctx: TaskContext) -> Result<TaskOutput> {
    debug!(task = %ctx.task, %command, ?args, "running task command");

    let output = tokio::process::Command::new(&command)
        .args(&args)
        .output()
        .await
        .map_err(|e| {
            PipehubError::task_execution(&ctx.task, format!("failed to spawn '{command}': {e}"))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipehubError::task_execution(
            &ctx.task,
            format!("'{command}' exited with {}: {}", output.status, tail(&stderr)),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut out = TaskOutput::new();
    out.insert("exit_code".into(), json!(output.status.code()));
    out.insert("stdout_tail".into(), json!(tail(&stdout)));
    Ok(out)
}

/// Last [`OUTPUT_TAIL_BYTES`] of a command's output, on a char boundary.
fn tail(s: &str) -> String {
    let trimmed = s.trim_end();
    if trimmed.len() <= OUTPUT_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - OUTPUT_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
