use crate::CheckpointCommand;
use anyhow::Result;
use ikoma_core::AppConfig;
use ikoma_store::{Checkpointer, checkpointer_for};
use std::io::{BufRead, Write};
use std::sync::Arc;

pub fn run_checkpoint(command: CheckpointCommand) -> Result<()> {
    let workspace = std::env::current_dir()?;
    let config = AppConfig::from_env(&workspace);
    let store = checkpointer_for(&config.paths.conversation_db)?;

    match command {
        CheckpointCommand::List { limit } => list_runs(&store, limit),
        CheckpointCommand::Show { run_id, steps } => show_run(&store, &run_id, steps),
        CheckpointCommand::Rm { run_id, force } => remove_run(&store, &run_id, force),
        CheckpointCommand::ClearAll { force } => clear_all(&store, force),
    }
}

fn list_runs(store: &Arc<Checkpointer>, limit: u64) -> Result<()> {
    let runs = store.list_runs(limit)?;
    if runs.is_empty() {
        println!("No checkpoint runs found.");
        return Ok(());
    }
    println!("{:<40} {:>6}  {}", "RUN ID", "STEPS", "LAST CHECKPOINT");
    for run in runs {
        println!("{:<40} {:>6}  {}", run.run_id, run.steps, run.last_ts);
    }
    Ok(())
}

fn show_run(store: &Arc<Checkpointer>, run_id: &str, show_steps: bool) -> Result<()> {
    let steps = store.get_steps(run_id)?;
    if steps.is_empty() {
        println!("No checkpoints found for run {run_id}.");
        return Ok(());
    }
    println!("Run {run_id}: {} step(s)", steps.len());
    for record in steps {
        println!("  step {} at {}", record.step, record.created_at);
        if show_steps {
            let iteration = record.state["current_iteration"].clone();
            let stop_reason = record.state["stop_reason"].clone();
            println!("    iteration: {iteration}, stop_reason: {stop_reason}");
            if let Some(results) = record.state["execution_results"].as_array() {
                for result in results {
                    println!(
                        "    [{}] {} -> {}",
                        result["status"].as_str().unwrap_or("?"),
                        result["tool_name"].as_str().unwrap_or("?"),
                        result["result"].as_str().unwrap_or("").trim()
                    );
                }
            }
        }
    }
    Ok(())
}

fn remove_run(store: &Arc<Checkpointer>, run_id: &str, force: bool) -> Result<()> {
    let steps = store.get_steps(run_id)?;
    if steps.is_empty() {
        println!("No checkpoints found for run {run_id}.");
        return Ok(());
    }
    if !force && !confirm(&format!("Delete {} step(s) of run {run_id}?", steps.len())) {
        println!("Cancelled.");
        return Ok(());
    }
    store.delete_run(run_id)?;
    println!("Deleted run {run_id}.");
    Ok(())
}

fn clear_all(store: &Arc<Checkpointer>, force: bool) -> Result<()> {
    if !force && !confirm("Delete ALL checkpoint runs?") {
        println!("Cancelled.");
        return Ok(());
    }
    let deleted = store.clear_all()?;
    println!("Deleted {deleted} checkpoint step(s).");
    Ok(())
}

fn confirm(question: &str) -> bool {
    print!("{question} (yes/no): ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "yes" | "y")
}
