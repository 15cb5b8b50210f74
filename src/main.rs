use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::info;

use cartprobe::config::ProbeConfig;
use cartprobe::error::ProbeError;
use cartprobe::events::{EventBus, ProbeEvent};
use cartprobe::page::chromium::{find_chromium, ChromiumSession};
use cartprobe::page::BrowserSession;
use cartprobe::probe::Prober;
use cartprobe::report;
use cartprobe::sentinel::{ChallengeMonitor, Sentinel};

#[derive(Parser)]
#[command(
    name = "cartprobe",
    about = "Cartprobe — discover real catalog stock through cart quantity ceilings",
    version,
    after_help = "Run 'cartprobe <command> --help' for details on each command."
)]
struct Cli {
    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a listing page and write the discovered stock to a JSON file
    Probe {
        /// Listing page URL to probe
        listing_url: String,
        /// Successful additions per cart flush (must stay below the site's
        /// cart capacity)
        #[arg(long)]
        flush_threshold: Option<u32>,
        /// Path to a JSON configuration file (selectors, signatures,
        /// timeouts)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Where to write the result records
        #[arg(long, default_value = "result.json")]
        output: PathBuf,
        /// Run the browser with a visible window
        #[arg(long)]
        headed: bool,
    },
    /// Check environment and diagnose issues
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Probe {
            listing_url,
            flush_threshold,
            config,
            output,
            headed,
        } => {
            init_tracing(cli.verbose);
            run_probe(listing_url, flush_threshold, config, output, headed).await
        }
        Commands::Doctor => {
            run_doctor();
            Ok(())
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "cartprobe", &mut io::stdout());
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "cartprobe=debug" } else { "cartprobe=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default.parse().expect("valid directive")),
        )
        .init();
}

async fn run_probe(
    listing_url: String,
    flush_threshold: Option<u32>,
    config_path: Option<PathBuf>,
    output: PathBuf,
    headed: bool,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => ProbeConfig::load(path)?,
        None => ProbeConfig::default(),
    };
    if let Some(threshold) = flush_threshold {
        config.flush_threshold = threshold;
    }
    config.validate()?;

    let sentinel = Arc::new(Sentinel::from_table(&config.signatures)?);
    let monitor = ChallengeMonitor::new();
    let events = Arc::new(EventBus::new(64));
    spawn_event_printer(&events);

    info!("launching browser");
    let session: Arc<dyn BrowserSession> =
        Arc::new(ChromiumSession::launch(headed, sentinel, monitor.clone()).await?);

    let prober = Prober::new(Arc::clone(&session), config, monitor, Arc::clone(&events));
    let result = prober.probe_url(&listing_url).await;
    let _ = session.shutdown().await;

    match result {
        Ok(set) => {
            report::write_json(&output, &set)?;
            println!(
                "  {} products written to {}",
                set.len(),
                output.display()
            );
            Ok(())
        }
        Err(err @ ProbeError::CaptchaDetected { .. }) => {
            eprintln!("  Probing aborted: {err}");
            eprintln!("  Quantities read under an active defense are discarded; do not retry automatically.");
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn spawn_event_printer(events: &Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                ProbeEvent::ListingReady { controls, .. } => {
                    eprintln!("  listing ready with {controls} eligible cards");
                }
                ProbeEvent::FlushStarted {
                    flush_index,
                    batch_size,
                } => {
                    eprintln!("  flush #{flush_index}: reading {batch_size} cart lines...");
                }
                ProbeEvent::FlushComplete {
                    flush_index,
                    lines_read,
                    unparsed_lines,
                    elapsed_ms,
                } => {
                    eprintln!(
                        "  flush #{flush_index} done: {lines_read} lines ({unparsed_lines} unparsed) in {elapsed_ms}ms"
                    );
                }
                ProbeEvent::ChallengeTripped { url, status } => {
                    eprintln!("  !! challenge response from {url} (status {status})");
                }
                ProbeEvent::ProbeFinished {
                    products,
                    flushes,
                    covered,
                    expected,
                    ..
                } => {
                    eprintln!(
                        "  finished: {products} products over {flushes} flushes ({covered}/{expected} positions covered)"
                    );
                }
                _ => {}
            }
        }
    });
}

fn run_doctor() {
    println!("cartprobe doctor");
    match find_chromium() {
        Some(path) => println!("[ok] Chromium found at {}", path.display()),
        None => println!(
            "[!!] Chromium NOT found. Set CARTPROBE_CHROMIUM_PATH or install Google Chrome."
        ),
    }
    match ProbeConfig::default().validate() {
        Ok(()) => println!("[ok] default configuration validates"),
        Err(e) => println!("[!!] default configuration invalid: {e}"),
    }
}
