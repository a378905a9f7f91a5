use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use weeki::agent::AgentRegistry;
use weeki::config::Config;
use weeki::core::{Directive, TaskState};
use weeki::orchestration::{KeywordDecomposer, Orchestrator, TaskStatus};
use weeki::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// weeki - run a directive through a pool of cooperating agents
#[derive(Parser, Debug)]
#[command(name = "weeki")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WEEKI_DEBUG=1     Enable debug logging (alternative to --debug)\n    WEEKI_LOG=<filter>  Full tracing filter, e.g. weeki=trace")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Decompose a directive, run it to completion and print the final status as JSON
    Run {
        /// The directive in natural language
        directive: String,

        /// Structured context passed to every agent, as a JSON value
        #[arg(long)]
        context: Option<String>,

        /// Override the maximum number of concurrent agents
        #[arg(long)]
        max_agents: Option<usize>,

        /// Override the per-agent timeout, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to the config file
        #[arg(long)]
        write: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load();
    let level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    weeki::log::init_with_level(cli.debug, &level);
    let config = config?;

    match cli.command {
        Command::Run {
            directive,
            context,
            max_agents,
            timeout,
        } => run_directive(config, directive, context, max_agents, timeout),
        Command::Config { write } => show_config(&config, write),
    }
}

/// Run one directive with the bundled agents and keyword decomposer.
///
/// Ctrl-C cancels the task; the partial status is still printed.
fn run_directive(
    mut config: Config,
    text: String,
    context: Option<String>,
    max_agents: Option<usize>,
    timeout: Option<u64>,
) -> Result<()> {
    if let Some(max_agents) = max_agents {
        config.max_agents = max_agents;
    }
    if let Some(timeout) = timeout {
        config.agent_timeout_secs = timeout;
    }
    config.validate()?;
    debug!(?config, "effective configuration");

    let mut directive = Directive::new(text);
    if let Some(context) = context {
        directive = directive.with_context(serde_json::from_str(&context)?);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let status = rt.block_on(async {
        let agents = AgentRegistry::with_builtin_agents(config.agent_delay());
        let orchestrator =
            Orchestrator::from_config(&config, agents, Arc::new(KeywordDecomposer::new()));
        let task_id = orchestrator.accept(directive)?;
        info!(task = %task_id, "running directive");

        let status = wait_for_task(&orchestrator, task_id).await;
        orchestrator.shutdown().await;
        status
    })?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.state == TaskState::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn wait_for_task(
    orchestrator: &Orchestrator,
    task_id: weeki::core::TaskId,
) -> Result<TaskStatus> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                warn!(task = %task_id.short(), "interrupted, cancelling task");
                orchestrator.cancel(&task_id)?;
            }
            _ = ticker.tick() => {}
        }

        let status = orchestrator.registry().get(&task_id)?;
        if status.state.is_terminal() {
            return Ok(status);
        }
    }
}

fn show_config(config: &Config, write: bool) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    if write {
        config.save()?;
        info!(path = %Config::config_path()?.display(), "configuration written");
    }
    Ok(())
}
