use crate::RunArgs;
use crate::context::{build_context, run_config};
use anyhow::Result;
use ikoma_citations::{CitationRegistry, CitationState};
use ikoma_core::RunState;
use std::io::{BufRead, Write};

/// `run --continuous --goal <text>`: one goal, no prompts, exit when done.
pub fn run_continuous(args: &RunArgs, goal: &str, verbose: bool) -> Result<()> {
    let ctx = build_context(verbose, !args.no_checkpoint, false)?;
    let config = run_config(
        &ctx.config.limits,
        args.max_iter,
        args.time_limit_mins,
        false,
    );
    let state = ctx.agent.run(goal, &config)?;
    print_final(&state);
    Ok(())
}

/// Plain `run`: a prompt loop reading goals from stdin until quit/exit.
pub fn run_interactive(args: &RunArgs, verbose: bool) -> Result<()> {
    let ctx = build_context(verbose, !args.no_checkpoint, true)?;
    println!("ikoma: plan-execute-reflect agent. Type 'quit' or 'exit' to end.");

    let stdin = std::io::stdin();
    loop {
        print!("you: ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let goal = line.trim();
        if goal.is_empty() {
            continue;
        }
        if matches!(goal.to_ascii_lowercase().as_str(), "quit" | "exit" | "q") {
            break;
        }

        let config = run_config(
            &ctx.config.limits,
            args.max_iter,
            args.time_limit_mins,
            true,
        );
        match ctx.agent.run(goal, &config) {
            Ok(state) => print_final(&state),
            Err(err) => eprintln!("run failed: {err:#}"),
        }
    }
    Ok(())
}

/// Print the final assistant message with citation markers resolved and a
/// Sources block appended when any are referenced.
fn print_final(state: &RunState) {
    let registry = serde_json::from_value::<CitationState>(state.citations.clone())
        .map(CitationRegistry::from_state)
        .unwrap_or_default();

    if let Some(message) = state.messages.last() {
        println!("{}", registry.render(&message.content));
    }
    if let Some(reason) = state.stop_reason {
        println!("\n[termination reason: {reason}]");
    }
}
