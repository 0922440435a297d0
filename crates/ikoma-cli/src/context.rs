use anyhow::Result;
use ikoma_agent::{Agent, ConfirmPrompter};
use ikoma_core::{AppConfig, LimitsConfig, RunConfig, RunState};
use ikoma_llm::OpenAiCompatClient;
use ikoma_memory::VectorStore;
use ikoma_observe::Observer;
use ikoma_tools::ToolHost;
use ikoma_web::{HttpFetcher, HttpFetcherConfig};
use std::io::{BufRead, Write};
use std::sync::Arc;
use uuid::Uuid;

/// Everything a run needs, constructed once at process start and injected
/// into the controller. The fetcher and memory handles stay accessible for
/// the diagnostic commands.
pub struct AppContext {
    pub config: AppConfig,
    pub agent: Agent,
    pub fetcher: Arc<HttpFetcher>,
    pub memory: Arc<VectorStore>,
}

pub fn build_context(verbose: bool, checkpointing: bool, interactive: bool) -> Result<AppContext> {
    let workspace = std::env::current_dir()?;
    let config = AppConfig::from_env(&workspace);

    let llm = Arc::new(OpenAiCompatClient::new(config.llm.clone())?);
    let memory = Arc::new(VectorStore::open(
        &config.paths.vector_store,
        llm.clone() as Arc<dyn ikoma_llm::LlmClient>,
    )?);
    let fetcher = Arc::new(HttpFetcher::new(HttpFetcherConfig::with_cache_dir(
        config.paths.http_cache.clone(),
    ))?);
    let tools = Arc::new(ToolHost::new(
        &config.paths.sandbox,
        fetcher.clone(),
        memory.clone(),
    )?);

    let checkpointer = if checkpointing && config.checkpointer.enabled {
        Some(ikoma_store::checkpointer_for(&config.paths.conversation_db)?)
    } else {
        None
    };

    let mut observer = Observer::new(&workspace)?;
    observer.set_verbose(verbose);

    let mut agent = Agent::new(
        llm,
        tools,
        memory.clone(),
        checkpointer,
        Arc::new(observer),
    );
    if interactive {
        agent = agent.with_prompter(Arc::new(StdinPrompter));
    }

    Ok(AppContext {
        config,
        agent,
        fetcher,
        memory,
    })
}

pub fn run_config(
    limits: &LimitsConfig,
    max_iter: Option<u32>,
    time_limit_mins: Option<u64>,
    interactive: bool,
) -> RunConfig {
    let run_id = format!("run-{}", Uuid::now_v7());
    let mut config = RunConfig::for_goal(run_id, limits);
    if let Some(max_iter) = max_iter {
        config.max_iterations = max_iter;
    }
    if let Some(mins) = time_limit_mins {
        config.time_limit_secs = Some(mins * 60);
    }
    config.interactive = interactive;
    config
}

/// Asks on stdin whether to keep going. Anything but an explicit no keeps
/// the run alive, and a closed stdin counts as yes so non-interactive
/// environments never stall.
pub struct StdinPrompter;

impl ConfirmPrompter for StdinPrompter {
    fn confirm(&self, state: &RunState) -> bool {
        print!(
            "Iteration {} complete. Continue? (yes/no): ",
            state.current_iteration
        );
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return true;
        }
        !matches!(answer.trim().to_ascii_lowercase().as_str(), "no" | "n")
    }
}
