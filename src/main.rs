//! memit-rs CLI: insert saved MEMIT deltas into a safetensors weight file

use anyhow::Result;
use clap::Parser;
use memit_rs::{insert_deltas, load_deltas, ComputeContext, DistancesReport, EditHyperParams, WeightMap};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "memit-rs")]
#[command(about = "Insert MEMIT deltas into model weights with the sparse update rule")]
#[command(version)]
struct Cli {
    /// Safetensors file holding the model weights
    #[arg(short, long)]
    weights: PathBuf,

    /// Safetensors file written by `save_deltas`
    #[arg(short, long)]
    deltas: PathBuf,

    /// Hyperparameter JSON the deltas were computed with
    #[arg(long)]
    hparams: PathBuf,

    /// Where to write the edited weights
    #[arg(short, long, default_value = "edited.safetensors")]
    output: PathBuf,

    /// Optional JSON report of per-layer norms
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Model name recorded with the weights
    #[arg(long, default_value = "model")]
    model_name: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== memit-rs: delta insertion ===");
    println!("Weights: {}", cli.weights.display());
    println!("Deltas:  {}", cli.deltas.display());
    println!("Output:  {}", cli.output.display());
    if cli.cpu {
        println!("Mode:    CPU (forced)");
    }

    let hparams = EditHyperParams::from_json_file(&cli.hparams)?;
    info!(
        "Editing layers {:?} of {} (sparse fraction {})",
        hparams.layers, hparams.rewrite_module_tmp, hparams.sparse_fraction
    );

    let ctx = ComputeContext::auto(cli.cpu);
    let mut weights = WeightMap::from_safetensors(&cli.model_name, &cli.weights, ctx.device())?;
    let deltas = load_deltas(&hparams, &cli.deltas)?;
    info!("Loaded {} deltas", deltas.len());

    let insertion = insert_deltas(&mut weights, &deltas, &hparams, false)?;

    println!("\n=== Inserted ===");
    for (layer, report) in &insertion.layers {
        println!(
            "Layer {:2}: |upd| = {:.4}, |W| {:.4} -> {:.4}",
            layer, report.delta_norm, report.original_weights_norm, report.new_weights_norm
        );
    }

    if let Some(parent) = cli.output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    weights.save_safetensors(&cli.output)?;
    info!("Edited weights saved to {}", cli.output.display());

    if let Some(report_path) = &cli.report {
        let report = DistancesReport {
            layers: insertion.layers,
            ..Default::default()
        };
        std::fs::write(report_path, serde_json::to_string_pretty(&report)?)?;
        info!("Report saved to {}", report_path.display());
    }

    Ok(())
}
