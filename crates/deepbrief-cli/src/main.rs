use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use deepbrief_core::{
    ConfigLoader, EventSink, PipelineRuntime, ResearchOptions, SearchBackend, SinkClosed,
    StreamEvent, forward, stream_research,
};
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "deepbrief", version, about = "Streaming deep-research pipeline")]
struct Cli {
    /// Path to the pipeline configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a research query and stream the brief to stdout.
    Run(RunArgs),
    /// Query the search backend and print the normalized candidates.
    Search(SearchArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Query to research.
    query: String,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Query to search for.
    query: String,

    /// Maximum number of candidates to print.
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,deepbrief_core=info"));

    // Logs go to stderr so the streamed brief owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let config = ConfigLoader::load(cli.config)?;
        let runtime = Arc::new(PipelineRuntime::from_config(config)?);

        match cli.command {
            Command::Run(args) => run_command(runtime, args).await?,
            Command::Search(args) => search_command(runtime, args).await?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn run_command(runtime: Arc<PipelineRuntime>, args: RunArgs) -> Result<()> {
    info!(query = %args.query, "starting research run");

    let receiver = stream_research(runtime, ResearchOptions::new(args.query));
    forward(receiver, StdoutSink::default()).await;

    Ok(())
}

async fn search_command(runtime: Arc<PipelineRuntime>, args: SearchArgs) -> Result<()> {
    let mut candidates = runtime.search.search(&args.query).await?;
    if let Some(limit) = args.limit {
        candidates.truncate(limit);
    }

    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}

/// Streams text deltas to stdout; everything else goes to the log.
#[derive(Default)]
struct StdoutSink {
    closed: bool,
}

#[async_trait]
impl EventSink for StdoutSink {
    async fn write(&mut self, event: &StreamEvent) -> Result<(), SinkClosed> {
        match event {
            StreamEvent::Text { delta } => {
                let mut stdout = std::io::stdout();
                if stdout
                    .write_all(delta.as_bytes())
                    .and_then(|_| stdout.flush())
                    .is_err()
                {
                    return Err(SinkClosed);
                }
            }
            StreamEvent::Status { stage, message } => {
                info!(stage = ?stage, "{message}");
            }
            StreamEvent::Tool { phase, name, .. } => {
                info!(tool = %name, phase = ?phase, "tool event");
            }
            StreamEvent::Error { message } => {
                eprintln!("error: {message}");
            }
            StreamEvent::Done { sources, .. } => {
                println!();
                info!(sources = *sources, "research complete");
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = std::io::stdout().flush();
        }
    }
}
