use crate::WebCommand;
use crate::context::build_context;
use anyhow::Result;
use serde_json::json;

pub fn run_web(command: WebCommand, verbose: bool) -> Result<()> {
    let ctx = build_context(verbose, false, false)?;
    match command {
        WebCommand::Stats => {
            let report = json!({
                "fetcher": ctx.fetcher.stats(),
                "domain_filter": ctx.fetcher.filter_status(),
                "memory": ctx.memory.stats()?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        WebCommand::ClearCache => {
            let removed = ctx.fetcher.clear_cache();
            println!("Cleared {removed} cached response(s).");
        }
        WebCommand::ResetStats => {
            ctx.fetcher.reset_stats();
            println!("Request statistics reset.");
        }
    }
    Ok(())
}
