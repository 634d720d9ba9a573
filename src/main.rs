use anyhow::{Context, bail};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use streamcmd::executor::CommandIdAssigner;
use streamcmd::{
    CommandConfig, CommandNode, FileCommandLog, InMemoryTopicClient, MetaStoreExecutor,
    ReplayOutcome,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Runs one node against a file-backed command log.
///
/// Statements are read from stdin, one per line. Each one is appended to the
/// log and its final status printed. `TERMINATE CLUSTER` stops the node.
#[derive(Parser, Debug)]
#[command(name = "streamcmd", version, about)]
struct Args {
    /// Command log file; created if missing
    #[arg(long)]
    log_file: PathBuf,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// How long to wait for each statement, overriding the config
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Topics that already exist on the broker
    #[arg(long, value_delimiter = ',')]
    topics: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CommandConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CommandConfig::default(),
    };
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.command_response_timeout_duration());

    let log = FileCommandLog::open(&args.log_file)
        .await
        .with_context(|| format!("opening command log {}", args.log_file.display()))?;

    let topics = InMemoryTopicClient::with_topics(args.topics.iter().cloned());
    topics.add_topic(config.command_topic());
    let executor = MetaStoreExecutor::new(Arc::new(topics.clone()))
        .with_command_topic(config.command_topic());

    let node = CommandNode::builder(config)
        .log(Arc::new(log))
        .executor(Box::new(executor))
        .topic_client(Arc::new(topics))
        .start()
        .await
        .context("starting node")?;

    if let ReplayOutcome::Terminated { error } = node.replay_outcome() {
        match error {
            Some(error) => bail!(
                "the cluster recorded in {} was terminated; cleanup failed: {}",
                args.log_file.display(),
                error
            ),
            None => bail!("the cluster recorded in {} was terminated", args.log_file.display()),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let statement = line.trim();
        if statement.is_empty() || statement.starts_with("--") {
            continue;
        }

        let terminates = CommandIdAssigner::command_id_for_text(statement)
            .map(|id| id.is_cluster_terminate())
            .unwrap_or(false);
        if terminates {
            match node.terminate(statement).await? {
                Some(status) => println!("cluster {}: {}", status.status, status.message),
                None => println!("cluster already stopped"),
            }
            return Ok(());
        }

        let queued = match node.submit(statement, BTreeMap::new()).await {
            Ok(queued) => queued,
            Err(err) => {
                println!("rejected: {}", err);
                continue;
            }
        };
        match node.queue().wait_for(&queued, timeout).await {
            Ok(status) => println!(
                "{} @{} {}: {}",
                queued.id, queued.sequence_number, status.status, status.message
            ),
            Err(err) => println!("{} @{} {}", queued.id, queued.sequence_number, err),
        }
    }

    node.close().await?;
    Ok(())
}
