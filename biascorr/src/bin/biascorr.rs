use std::{fs::File, io::BufWriter, path::PathBuf};

use anyhow::{Context, ensure};
use biascorr::{
    CorrectionConfig, CorrectionMode, CorrectionReport, MissingLayerPolicy, Model,
    QuantizationConfig, bias_correction,
    metrics::{layer_sqnr, output_sqnr},
    quantize_model,
    testing::{self, CalibrationSet},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a chain model, degrade a copy of it and correct the biases of the copy.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Chain to build
    #[arg(long, value_enum, default_value_t = ModelKind::Linear, env = "BIASCORR_MODEL")]
    model: ModelKind,

    /// Correction mode, overrides the config file
    #[arg(long, value_enum)]
    mode: Option<CorrectionMode>,

    /// How the copy to correct is obtained from the float model
    #[arg(long, value_enum, default_value_t = Perturb::Quantize)]
    perturb: Perturb,

    /// Factor applied to the biases with `--perturb scale`
    #[arg(long, default_value_t = 10.0)]
    scale: f32,

    /// Number of calibration batches
    #[arg(long, default_value_t = 5)]
    batches: usize,

    /// Samples per calibration batch
    #[arg(long, default_value_t = 10)]
    batch_size: usize,

    /// Batches evaluated per layer, overrides the config file
    #[arg(long)]
    neval_batches: Option<usize>,

    /// Behaviour when a layer has no quantized counterpart, overrides the config file
    #[arg(long, value_enum)]
    on_missing_layer: Option<MissingLayerPolicy>,

    #[arg(long, default_value_t = 0, env = "BIASCORR_SEED")]
    seed: u64,

    /// JSON correction config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write the JSON summary of the run
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
enum ModelKind {
    /// linear 3 -> 4 -> 5 -> 6
    Linear,
    /// conv 3 -> 4 -> 5 -> 6, kernel 5, stride 5, on 125x125 inputs
    Conv,
}

#[derive(Clone, Copy, Debug, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
enum Perturb {
    /// Multiply every bias of a float copy by `--scale`
    Scale,
    /// Post-training quantization of the float model
    Quantize,
}

#[derive(Debug, Serialize)]
struct LayerSummary {
    path: String,
    weight_sqnr: f64,
    bias_sqnr_before: Option<f64>,
    bias_sqnr_after: Option<f64>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    model: ModelKind,
    perturb: Perturb,
    config: CorrectionConfig,
    output_sqnr_before: f64,
    output_sqnr_after: f64,
    layers: Vec<LayerSummary>,
    report: CorrectionReport,
}

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set global subscriber")?;

    match Cli::parse().command {
        Command::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    ensure!(args.batches > 0, "at least one calibration batch is needed");
    ensure!(args.batch_size > 0, "batch size must be positive");
    let config = load_config(&args)?;

    let mut rng = testing::seeded_rng(args.seed);
    let (float_model, data) = build(&args, &mut rng)?;
    let mut quant_model = match args.perturb {
        Perturb::Scale => {
            let mut model = float_model.clone();
            let scaled = testing::scale_biases(&mut model, args.scale)?;
            info!(scaled, factor = args.scale, "biases scaled");
            model
        }
        Perturb::Quantize => quantize_model(&float_model, &data, &QuantizationConfig::default())?,
    };

    let before = quant_model.clone();
    let output_sqnr_before = output_sqnr(&float_model, &quant_model, &data)?;
    let report = bias_correction(&float_model, &mut quant_model, &data, &config)?;
    let output_sqnr_after = output_sqnr(&float_model, &quant_model, &data)?;

    let layers = report
        .corrected
        .iter()
        .map(|c| {
            Ok(LayerSummary {
                path: c.path.clone(),
                weight_sqnr: layer_sqnr(&float_model, &quant_model, &c.path, "weight")?,
                bias_sqnr_before: layer_sqnr(&float_model, &before, &c.path, "bias").ok(),
                bias_sqnr_after: layer_sqnr(&float_model, &quant_model, &c.path, "bias").ok(),
            })
        })
        .collect::<biascorr::Result<Vec<_>>>()?;

    let summary = RunSummary {
        model: args.model,
        perturb: args.perturb,
        config,
        output_sqnr_before,
        output_sqnr_after,
        layers,
        report,
    };
    print_summary(&summary);
    if let Some(path) = &args.output {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &summary)
            .with_context(|| format!("writing summary to {}", path.display()))?;
        info!(path = %path.display(), "summary written");
    }
    Ok(())
}

/// Config file values, overridden by the flags given on the command line.
fn load_config(args: &RunArgs) -> anyhow::Result<CorrectionConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            serde_json::from_reader(file)
                .with_context(|| format!("parsing correction config {}", path.display()))?
        }
        None => CorrectionConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if args.neval_batches.is_some() {
        config.neval_batches = args.neval_batches;
    }
    if let Some(policy) = args.on_missing_layer {
        config.on_missing_layer = policy;
    }
    Ok(config)
}

fn build(
    args: &RunArgs,
    rng: &mut rand_chacha::ChaCha8Rng,
) -> anyhow::Result<(Model, CalibrationSet)> {
    let (model, shape) = match args.model {
        ModelKind::Linear => (
            testing::linear_chain(rng, &[3, 4, 5, 6])?,
            vec![args.batch_size, 3],
        ),
        ModelKind::Conv => (
            testing::conv_chain(rng, &[3, 4, 5, 6], 5, 5)?,
            vec![args.batch_size, 3, 125, 125],
        ),
    };
    Ok((model, testing::calibration_set(rng, args.batches, &shape)))
}

#[allow(clippy::print_stdout)]
fn print_summary(summary: &RunSummary) {
    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"));
    println!(
        "{:?} chain, {:?} correction: output SQNR {:.2} dB -> {:.2} dB",
        summary.model, summary.config.mode, summary.output_sqnr_before, summary.output_sqnr_after
    );
    println!(
        "{:<12} {:>12} {:>14} {:>14}",
        "layer", "weight dB", "bias dB before", "bias dB after"
    );
    for layer in &summary.layers {
        println!(
            "{:<12} {:>12.2} {:>14} {:>14}",
            layer.path,
            layer.weight_sqnr,
            fmt(layer.bias_sqnr_before),
            fmt(layer.bias_sqnr_after)
        );
    }
    for skipped in &summary.report.skipped {
        println!("{:<12} skipped: {:?}", skipped.path, skipped.reason);
    }
}
