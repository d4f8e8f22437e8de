mod input;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bench360_benchmark::{DriverEvent, HttpInferenceClient, RunController, RunOutcome};
use bench360_core::{EnergyBasis, HarnessConfig, PromptUnit, RunReport};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bench360")]
#[command(about = "Bench360 - workload scenarios and metrics for LLM inference backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configuration in a sweep file
    Run {
        /// Sweep file: {"harness": {...}, "runs": [...]}
        #[arg(short, long)]
        sweep: PathBuf,

        /// Prompt units, one JSON object per line
        #[arg(short, long)]
        prompts: PathBuf,

        /// Output directory (overrides BENCH360_OUTPUT_DIR)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Arrival seed (overrides BENCH360_SEED)
        #[arg(long)]
        seed: Option<u64>,

        /// Summary format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// List models served by a backend
    Models {
        /// Backend identifier, e.g. vllm
        #[arg(short, long)]
        backend: String,

        /// Sweep file whose harness section defines the backends
        #[arg(short, long)]
        sweep: Option<PathBuf>,
    },

    /// Show backend connectivity
    Status {
        #[arg(short, long)]
        sweep: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            sweep,
            prompts,
            output,
            seed,
            format,
        } => cmd_run(sweep, prompts, output, seed, &format).await?,
        Commands::Models { backend, sweep } => cmd_models(&backend, sweep).await?,
        Commands::Status { sweep } => cmd_status(sweep).await?,
    }

    Ok(())
}

fn load_harness(sweep: Option<PathBuf>) -> Result<HarnessConfig> {
    match sweep {
        Some(path) => Ok(input::load_sweep(&path)?.harness),
        None => Ok(HarnessConfig::default()),
    }
}

async fn cmd_run(
    sweep_path: PathBuf,
    prompts_path: PathBuf,
    output: Option<PathBuf>,
    seed: Option<u64>,
    format: &str,
) -> Result<()> {
    let sweep = input::load_sweep(&sweep_path)?;
    let prompts: Arc<[PromptUnit]> = input::load_prompts(&prompts_path)?.into();

    let mut harness = sweep.harness;
    input::apply_overrides(
        &mut harness,
        |key| std::env::var(key).ok(),
        output.as_deref(),
        seed,
    )?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting current run");
            on_signal.cancel();
        }
    });

    let (tx, rx) = mpsc::channel(1024);
    let progress = tokio::spawn(print_progress(rx));

    println!();
    println!("Running sweep...");
    println!("  Configurations: {}", sweep.runs.len());
    println!("  Prompts:        {}", prompts.len());
    println!("  Output:         {}", harness.output_dir.display());
    println!();

    let controller = RunController::new(harness, cancel).with_events(tx);
    let outcomes = controller.run_sweep(sweep.runs, prompts).await;
    let failed_log = controller.store().failed_log_path();
    drop(controller);
    let _ = progress.await;

    match format {
        "json" => {
            let reports: Vec<_> = outcomes.iter().filter_map(RunOutcome::report).collect();
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        _ => print_summary(&outcomes),
    }

    let failures = outcomes.iter().filter(|o| o.failure().is_some()).count();
    if failures > 0 {
        println!("  {} configuration(s) recorded in {}", failures, failed_log.display());
        println!();
    }
    info!(runs = outcomes.len(), failures, "Sweep finished");
    Ok(())
}

async fn print_progress(mut rx: mpsc::Receiver<DriverEvent>) {
    let mut completed = 0u32;
    while let Some(event) = rx.recv().await {
        match event {
            DriverEvent::StateChanged { to, .. } => {
                if to.is_terminal() {
                    println!("  {} ({} requests)", to.as_str(), completed);
                    completed = 0;
                } else {
                    println!("  {}", to.as_str());
                }
            }
            DriverEvent::BatchStarted { index, size } => {
                println!("    batch {} ({} requests)", index + 1, size);
            }
            DriverEvent::Sample { .. } => completed += 1,
            DriverEvent::Aborted { reason } => println!("  aborted: {}", reason),
        }
    }
}

fn print_summary(outcomes: &[RunOutcome]) {
    println!();
    println!("Results:");
    println!("{:-<108}", "");
    println!(
        "  {:<9} {:<36} {:>8} {:>10} {:>10} {:>10} {:>14}",
        "Status", "Configuration", "Success", "p50 TTFT", "p50 Lat", "Tok/s", "Energy (Wh)"
    );
    println!("{:-<108}", "");

    for outcome in outcomes {
        let Some(report) = outcome.report() else {
            let error = outcome.failure().map(|f| f.error.as_str()).unwrap_or("-");
            println!("  {:<9} {}", outcome.status(), error);
            continue;
        };

        let label = format!(
            "{}/{} {} {}",
            report.config.backend,
            report.config.model,
            report.config.scenario.label(),
            report.config.scenario.sweep_tag()
        );
        let ttft = report
            .ttft
            .as_ref()
            .map(|s| format!("{:.1} ms", s.p50_ms))
            .unwrap_or_else(|| "-".to_string());
        let latency = report
            .latency
            .as_ref()
            .map(|s| format!("{:.1} ms", s.p50_ms))
            .unwrap_or_else(|| "-".to_string());
        let energy = match report.energy.energy_wh {
            Some(wh) => format!("{:.3} {}", wh, basis_marker(report)),
            None => "-".to_string(),
        };

        println!(
            "  {:<9} {:<36} {:>7.1}% {:>10} {:>10} {:>10.1} {:>14}",
            outcome.status(),
            truncate(&label, 36),
            report.success_rate * 100.0,
            ttft,
            latency,
            report.throughput.tokens_per_sec,
            energy
        );
    }
    println!();
}

fn basis_marker(report: &RunReport) -> &'static str {
    match report.energy.basis {
        EnergyBasis::Measured => " ",
        EnergyBasis::Estimated => "~",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut)
}

async fn cmd_models(backend: &str, sweep: Option<PathBuf>) -> Result<()> {
    let harness = load_harness(sweep)?;
    let endpoint = harness.resolve_backend(backend)?;
    let client = HttpInferenceClient::new(&endpoint.base_url, "", endpoint.api, 1)?;
    let models = client.list_models().await?;

    println!();
    println!("Models on {} ({}):", backend, endpoint.base_url);
    println!("{:-<60}", "");
    for (i, id) in models.iter().enumerate() {
        println!("  {:<4} {}", i + 1, id);
    }
    println!();

    Ok(())
}

async fn cmd_status(sweep: Option<PathBuf>) -> Result<()> {
    let harness = load_harness(sweep)?;
    println!("Backend Status:");
    println!("{:-<60}", "");

    for (name, endpoint) in &harness.backends {
        let client = HttpInferenceClient::new(&endpoint.base_url, "", endpoint.api, 1)?;
        match client.list_models().await {
            Ok(models) => println!(
                "  {:<10} {:<28} connected ({} models)",
                name,
                endpoint.base_url,
                models.len()
            ),
            Err(e) => println!("  {:<10} {:<28} disconnected ({})", name, endpoint.base_url, e),
        }
    }
    println!("  Output dir: {}", harness.output_dir.display());

    Ok(())
}
