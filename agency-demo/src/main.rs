// ABOUTME: Simulated agency - Developer, QA, and DevOps agents contending for shared tools.
// ABOUTME: Streams the live lock feed as JSON lines and lets the monitor break a forced deadlock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolmux::prelude::*;

const TOOLS: [&str; 4] = ["CodeEditor", "TestRunner", "DeployPipeline", "Database"];

#[derive(Parser, Debug)]
#[command(name = "agency-demo", about = "Multi-agent tool locking demo")]
struct Args {
    /// TOML configuration file for the lock service
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tool invocations per agent
    #[arg(long, default_value_t = 5)]
    rounds: usize,

    /// Deadlock monitor period in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Strategy the monitor uses to break deadlocks
    #[arg(long)]
    strategy: Option<ResolutionStrategy>,

    /// Print only conflict and deadlock messages from the live feed
    #[arg(long)]
    conflicts_only: bool,
}

// ============================================================================
// Live feed sink
// ============================================================================

/// Prints each live message as one JSON line.
struct StdoutSink {
    conflicts_only: bool,
}

#[async_trait]
impl EventSink for StdoutSink {
    async fn deliver(&self, message: &LiveMessage) -> Result<(), anyhow::Error> {
        println!("{}", serde_json::to_string(message)?);
        Ok(())
    }

    fn accepts(&self, message: &LiveMessage) -> bool {
        !self.conflicts_only
            || matches!(
                message,
                LiveMessage::ConflictEvent(_) | LiveMessage::DeadlockDetected(_)
            )
    }
}

// ============================================================================
// Agents
// ============================================================================

struct AgentProfile {
    name: &'static str,
    priority: u8,
    tools: &'static [&'static str],
}

static AGENTS: [AgentProfile; 3] = [
    AgentProfile {
        name: "Developer",
        priority: 5,
        tools: &["CodeEditor", "TestRunner", "Database"],
    },
    AgentProfile {
        name: "QA",
        priority: 3,
        tools: &["TestRunner", "Database"],
    },
    AgentProfile {
        name: "DevOps",
        priority: 4,
        tools: &["DeployPipeline", "Database", "CodeEditor"],
    },
];

async fn run_agent(service: Arc<ConcurrencyService>, profile: &AgentProfile, rounds: usize) -> Result<()> {
    for round in 0..rounds {
        let (tool, work_ms) = {
            let mut rng = rand::thread_rng();
            let tool = profile.tools[rng.gen_range(0..profile.tools.len())];
            (tool, rng.gen_range(20..120))
        };

        let request = AcquireRequest::new(profile.name, tool)
            .priority(profile.priority)
            .timeout(Duration::from_secs(2))
            .retry_count(round as u32)
            .context(format!("{}-round-{round}", profile.name));
        let outcome = service
            .manager()
            .run_exclusive(request, tokio::time::sleep(Duration::from_millis(work_ms)))
            .await;

        match outcome {
            Ok(()) => info!(agent = profile.name, tool, work_ms, "tool call finished"),
            Err(LockError::Timeout { .. }) => info!(agent = profile.name, tool, "gave up waiting for tool"),
            Err(err) => return Err(err).context(format!("{} failed on {tool}", profile.name)),
        }
    }
    Ok(())
}

/// Developer holds CodeEditor and wants DeployPipeline; DevOps the reverse.
async fn force_deadlock(service: Arc<ConcurrencyService>) -> Result<()> {
    let editor = service
        .acquire(AcquireRequest::new("Developer", "CodeEditor").priority(5))
        .await?;
    let pipeline = service
        .acquire(AcquireRequest::new("DevOps", "DeployPipeline").priority(4))
        .await?;

    let contenders = [
        ("Developer", "DeployPipeline", 5),
        ("DevOps", "CodeEditor", 4),
    ]
    .map(|(agent, resource, priority)| {
        let service = service.clone();
        tokio::spawn(async move {
            let outcome = service
                .acquire(AcquireRequest::new(agent, resource).priority(priority))
                .await;
            if outcome.is_ok() {
                // Finish the call and give back everything this agent holds.
                service.manager().release_all(agent);
            }
            (agent, outcome)
        })
    });

    for handle in contenders {
        match handle.await? {
            (agent, Ok(grant)) => {
                info!(agent, resource = %grant.resource, waited = ?grant.waited, "deadlocked call completed")
            }
            (agent, Err(err)) => info!(agent, error = %err, "deadlocked call failed"),
        }
    }
    // Locks overridden by the resolver are already gone.
    let _ = service.release(editor.lock_id);
    let _ = service.release(pipeline.lock_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ManagerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    config.monitor.interval_ms = args.interval_ms.unwrap_or(250);
    if let Some(strategy) = args.strategy {
        config.monitor.strategy = strategy;
    }

    let service = Arc::new(ConcurrencyService::new(config)?);
    let feed = service.forward_to(Arc::new(StdoutSink {
        conflicts_only: args.conflicts_only,
    }));
    service.start_monitoring();

    info!(tools = ?TOOLS, agents = AGENTS.len(), "agency started");

    let mut agents = Vec::new();
    for profile in &AGENTS {
        let service = service.clone();
        let rounds = args.rounds;
        agents.push(tokio::spawn(async move { run_agent(service, profile, rounds).await }));
    }
    for agent in agents {
        agent.await??;
    }

    force_deadlock(service.clone()).await?;

    let analytics = service.analytics().await;
    eprintln!("{}", serde_json::to_string_pretty(&analytics)?);

    service.shutdown().await;
    feed.stop().await;
    Ok(())
}
