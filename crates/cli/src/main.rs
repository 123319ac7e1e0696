//! `vrt`: the control-plane CLI around the recognition engine.
//!
//! Four subcommands, one per offline/online boundary in the spec:
//! - `run` drives the hot loop over a fixture and writes the end-of-run
//!   artifacts (§4.8, §6).
//! - `build-shard` is the offline LabelBank build step (§4.1 `build`).
//! - `promote` is the offline KB promotion step (§4.5), run against a
//!   closed Ledger file, never concurrently with `run` (§9 staging).
//! - `verify-ledger` re-verifies a Ledger's hash chain on demand (§4.6).

mod config_loader;
mod fixture;
mod gallery_io;
mod shard_io;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use config_loader::CliOverrides;
use fixture::{FixtureSource, IdentityEmbedder};
use vrt_core::error::Error;
use vrt_core::match_result::UNKNOWN_LABEL;
use vrt_engine::Engine;
use vrt_labelbank::Shard;
use vrt_ledger::{verify_chain, Ledger};
use vrt_promote::{accepted_by_class, promote_all, PromotionLedger, DEFAULT_LAMBDA};

#[derive(Debug, Parser)]
#[command(name = "vrt", about = "Latency-bounded open-set recognition engine")]
struct Cli {
    #[command(subcommand)]
    command: VrtCommand,
}

#[derive(Debug, Subcommand)]
enum VrtCommand {
    /// Run the hot loop over a fixture of pre-embedded frames.
    Run(RunArgs),
    /// Build a LabelBank shard from a JSON exemplar set.
    BuildShard(BuildShardArgs),
    /// Promote accepted Ledger entries into int8 medoids.
    Promote(PromoteArgs),
    /// Re-verify a Ledger's hash chain.
    VerifyLedger(VerifyLedgerArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// JSONL fixture of `{embedding, bbox?, timestamp_ms?, detect_ms?, track_ms?}` rows.
    #[arg(long)]
    fixture: PathBuf,
    /// LabelBank shard file, produced by `build-shard`. Falls back to
    /// `paths.kb_json` from the resolved config when omitted.
    #[arg(long)]
    shard: Option<PathBuf>,
    /// Curated Verify gallery JSON. Omit to run with an empty gallery
    /// (every candidate rejects as `UnknownLabel`).
    #[arg(long)]
    gallery: Option<PathBuf>,
    /// Evidence ledger file; created if it doesn't exist.
    #[arg(long)]
    ledger: PathBuf,
    /// Directory `results.jsonl`, `metrics.json`, and `stage_timings.csv` are written into.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    /// Optional TOML manifest, lowest-precedence config layer.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Exit 2 if the final windowed p95 exceeds `latency.budget_ms` (§7 `BudgetBreach`).
    #[arg(long)]
    gate: bool,

    #[arg(long)]
    latency_budget_ms: Option<u64>,
    #[arg(long)]
    latency_window: Option<usize>,
    #[arg(long)]
    latency_low_water: Option<f64>,
    #[arg(long)]
    pipeline_frame_stride: Option<u32>,
    #[arg(long)]
    pipeline_min_stride: Option<u32>,
    #[arg(long)]
    pipeline_max_stride: Option<u32>,
    #[arg(long)]
    pipeline_auto_stride: Option<bool>,
    #[arg(long)]
    matcher_topk: Option<usize>,
    #[arg(long)]
    matcher_threshold: Option<f32>,
    #[arg(long)]
    matcher_min_neighbors: Option<usize>,
    #[arg(long)]
    oracle_maxlen: Option<usize>,
    /// Low end of the expected unknown-rate band (§6 `unknown_rate_band`).
    #[arg(long)]
    unknown_rate_band_low: Option<f64>,
    /// High end of the expected unknown-rate band.
    #[arg(long)]
    unknown_rate_band_high: Option<f64>,
}

#[derive(Debug, Args)]
struct BuildShardArgs {
    /// JSON array of `{label, vector}` exemplar rows.
    #[arg(long)]
    exemplars: PathBuf,
    /// Output shard file path.
    #[arg(long)]
    out: PathBuf,
    /// ε: tolerated other-class acceptance rate (§4.4).
    #[arg(long, default_value_t = vrt_labelbank::calibration::DEFAULT_EPSILON)]
    epsilon: f64,
    /// Target same-class recall (§4.4).
    #[arg(long, default_value_t = vrt_labelbank::calibration::TARGET_RECALL)]
    recall: f64,
}

#[derive(Debug, Args)]
struct PromoteArgs {
    /// Evidence ledger file to promote from.
    #[arg(long)]
    ledger: PathBuf,
    /// Directory medoid files are written into.
    #[arg(long)]
    out_dir: PathBuf,
    /// Promotion ledger file, appended to once per promoted class.
    #[arg(long)]
    promotion_ledger: PathBuf,
    /// Diversity penalty λ in the herding objective (§4.5 step 3).
    #[arg(long, default_value_t = DEFAULT_LAMBDA)]
    lambda: f64,
}

#[derive(Debug, Args)]
struct VerifyLedgerArgs {
    /// Evidence ledger file to verify.
    #[arg(long)]
    ledger: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        VrtCommand::Run(args) => run(args),
        VrtCommand::BuildShard(args) => build_shard(args),
        VrtCommand::Promote(args) => promote(args),
        VrtCommand::VerifyLedger(args) => verify_ledger(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(args: RunArgs) -> Result<(), Error> {
    let unknown_rate_band = match (args.unknown_rate_band_low, args.unknown_rate_band_high) {
        (None, None) => None,
        (low, high) => {
            let default = vrt_core::config::Config::default().unknown_rate_band;
            Some([low.unwrap_or(default[0]), high.unwrap_or(default[1])])
        }
    };
    let overrides = CliOverrides {
        latency_budget_ms: args.latency_budget_ms,
        latency_window: args.latency_window,
        latency_low_water: args.latency_low_water,
        pipeline_frame_stride: args.pipeline_frame_stride,
        pipeline_min_stride: args.pipeline_min_stride,
        pipeline_max_stride: args.pipeline_max_stride,
        pipeline_auto_stride: args.pipeline_auto_stride,
        matcher_topk: args.matcher_topk,
        matcher_threshold: args.matcher_threshold,
        matcher_min_neighbors: args.matcher_min_neighbors,
        oracle_maxlen: args.oracle_maxlen,
        unknown_rate_band,
    };
    let config = config_loader::resolve(overrides, args.config.as_deref())?;

    let shard_path = args
        .shard
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.paths_kb_json));
    let shard = Shard::open(&shard_path)?;
    let gallery = match &args.gallery {
        Some(path) => gallery_io::load_gallery(path)?,
        None => gallery_io::empty_gallery(),
    };
    let ledger = Ledger::open_or_create(&args.ledger)?;
    let frame_source = FixtureSource::open(&args.fixture)?;

    std::fs::create_dir_all(&args.out_dir)?;

    let mut engine = Engine::new(config.clone(), shard, gallery, ledger, frame_source);
    let report = engine.run(&IdentityEmbedder)?;

    write_results_jsonl(&args.out_dir.join("results.jsonl"), &report.results)?;
    report.metrics.write_json(args.out_dir.join("metrics.json"))?;
    report
        .stage_timings
        .write_stage_timings_csv(args.out_dir.join("stage_timings.csv"))?;

    let unknown_count = report
        .results
        .iter()
        .filter(|r| r.label == UNKNOWN_LABEL)
        .count();
    tracing::info!(
        frames = report.results.len(),
        unknown = unknown_count,
        fps = report.metrics.fps,
        p95_ms = report.metrics.p95,
        oracle_shed = report.oracle_metrics.shed_count,
        verify_accepted = report.verify_metrics.accepted,
        "run complete"
    );

    if args.gate && report.metrics.p95 > config.latency_budget_ms as f64 {
        return Err(Error::BudgetBreach {
            observed_ms: report.metrics.p95,
            budget_ms: config.latency_budget_ms as f64,
        });
    }

    Ok(())
}

fn write_results_jsonl(
    path: &std::path::Path,
    results: &[vrt_core::match_result::MatchResult],
) -> Result<(), Error> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    for result in results {
        serde_json::to_writer(&mut file, result)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

fn build_shard(args: BuildShardArgs) -> Result<(), Error> {
    let exemplars = shard_io::load_exemplars(&args.exemplars)?;
    let shard = Shard::build(exemplars, args.epsilon, args.recall)?;
    shard.save(&args.out)?;
    tracing::info!(
        rows = shard.count(),
        dim = shard.dim(),
        struct_hash = shard.struct_hash(),
        path = %args.out.display(),
        "built labelbank shard"
    );
    Ok(())
}

fn promote(args: PromoteArgs) -> Result<(), Error> {
    let ledger = Ledger::open_or_create(&args.ledger)?;
    let entries = ledger.load()?;
    let by_class = accepted_by_class(&entries);
    let promotion_ledger = PromotionLedger::open(&args.promotion_ledger);

    let summary = promote_all(&by_class, &args.out_dir, &promotion_ledger, args.lambda)?;
    for (label, count) in &summary.promoted {
        tracing::info!(label, medoids = count, "promoted class");
    }
    for skip in &summary.skipped {
        tracing::info!(%skip, "promotion skipped");
    }
    Ok(())
}

fn verify_ledger(args: VerifyLedgerArgs) -> Result<(), Error> {
    let ledger = Ledger::open_or_create(&args.ledger)?;
    let entries = ledger.load()?;
    let verification = verify_chain(&entries)?;
    println!(
        "ledger ok: {} entries ({} accepted, {} rejected)",
        verification.length, verification.accepted, verification.rejected
    );
    Ok(())
}
