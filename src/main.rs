use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use scextract::config::PipelineConfig;
use scextract::segment::{
    write_segmentation_store, ClassicalWorkflow, DeepWorkflow, Segmenter,
};
use scextract::{channels, extract, segment};

#[derive(Parser)]
#[command(
    name = "scextract",
    about = "single-cell pipeline: segment, segment-dl, extract"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classical segmentation: threshold + watershed nuclei, WGA cytosol.
    Segment(SegmentArgs),
    /// Deep-learning segmentation: tiled ONNX inference + mask matching.
    SegmentDl(SegmentDlArgs),
    /// Extract per-cell crops from a segmentation store.
    Extract(ExtractArgs),
}

#[derive(Args, Clone)]
struct SegmentArgs {
    /// Channel TIFFs in acquisition order {nucleus, cytosol, ...}, or one
    /// directory containing channelNNN.tif files.
    #[arg(long, required = true, num_args = 1..)]
    input: Vec<String>,
    /// Output segmentation store (zarr)
    #[arg(long)]
    output: String,
    /// JSON parameter file; missing sections fall back to defaults
    #[arg(long)]
    config: Option<String>,
}

#[derive(Args, Clone)]
struct SegmentDlArgs {
    #[arg(long, required = true, num_args = 1..)]
    input: Vec<String>,
    #[arg(long)]
    output: String,
    #[arg(long)]
    config: Option<String>,
    /// Model directory containing model.onnx (overrides config)
    #[arg(long)]
    nucleus_model: Option<String>,
    #[arg(long)]
    cytosol_model: Option<String>,
    /// Force CPU (skip CUDA)
    #[arg(long)]
    cpu: bool,
}

#[derive(Args, Clone)]
struct ExtractArgs {
    /// Segmentation store produced by segment or segment-dl
    #[arg(long)]
    input: String,
    /// Output single-cell store (zarr)
    #[arg(long)]
    output: String,
    #[arg(long)]
    config: Option<String>,
    /// Optional CSV report of written and skipped cells
    #[arg(long)]
    report: Option<String>,
}

/// Progress sink: an indicatif bar on a terminal, JSON lines otherwise so
/// a driving process can parse {"progress": p, "message": m} from stderr.
fn make_progress() -> Box<dyn Fn(f64, &str) + Sync> {
    if io::stderr().is_terminal() {
        let bar = ProgressBar::new(1000);
        if let Ok(style) =
            ProgressStyle::with_template("[{bar:40.cyan/blue}] {percent:>3}% {msg}")
        {
            bar.set_style(style);
        }
        Box::new(move |prog: f64, msg: &str| {
            bar.set_position((prog.clamp(0.0, 1.0) * 1000.0) as u64);
            bar.set_message(msg.to_string());
        })
    } else {
        Box::new(|prog: f64, msg: &str| {
            let _ = writeln!(
                io::stderr(),
                "{}",
                serde_json::json!({"progress": prog, "message": msg})
            );
            let _ = io::stderr().flush();
        })
    }
}

fn run_segment(args: SegmentArgs, progress: &(dyn Fn(f64, &str) + Sync)) -> scextract::Result<()> {
    let cfg = PipelineConfig::load(args.config.as_deref().map(Path::new))?;
    let paths = channels::resolve_inputs(&args.input)?;
    let stack = channels::load_channels(&paths)?;
    let workflow = ClassicalWorkflow {
        preprocess: cfg.preprocess,
        nucleus: cfg.nucleus,
        wga: cfg.wga,
    };
    let masks = workflow.segment(&stack, progress)?;
    write_segmentation_store(Path::new(&args.output), &stack, &masks)?;
    progress(1.0, &format!("Wrote {}", args.output));
    Ok(())
}

fn run_segment_dl(
    args: SegmentDlArgs,
    progress: &(dyn Fn(f64, &str) + Sync),
) -> scextract::Result<()> {
    let mut cfg = PipelineConfig::load(args.config.as_deref().map(Path::new))?;
    if let Some(m) = args.nucleus_model {
        cfg.dl.nucleus_model = m;
    }
    if let Some(m) = args.cytosol_model {
        cfg.dl.cytosol_model = m;
    }
    let paths = channels::resolve_inputs(&args.input)?;
    let stack = channels::load_channels(&paths)?;
    let (h, w) = (stack[0].dim().0, stack[0].dim().1);
    log::info!(
        "running tiled inference over {} shard(s)",
        scextract::dl::shard_count(h, w, &cfg.dl)
    );
    let workflow = DeepWorkflow {
        preprocess: cfg.preprocess,
        dl: cfg.dl,
        cache_dir: PathBuf::from(format!("{}.shard_cache", args.output)),
        force_cpu: args.cpu,
    };
    let masks = workflow.segment(&stack, progress)?;
    write_segmentation_store(Path::new(&args.output), &stack, &masks)?;
    progress(1.0, &format!("Wrote {}", args.output));
    Ok(())
}

fn run_extract(args: ExtractArgs, progress: &(dyn Fn(f64, &str) + Sync)) -> scextract::Result<()> {
    let cfg = PipelineConfig::load(args.config.as_deref().map(Path::new))?;
    let store = segment::read_segmentation_store(Path::new(&args.input))?;
    let report = extract::extract_cells(
        &store.channels,
        &store.nucleus,
        &store.cytosol,
        &cfg.extract,
        Path::new(&args.output),
        args.report.as_deref().map(Path::new),
        &progress,
    )?;
    progress(
        1.0,
        &format!(
            "Extracted {} cells ({} skipped) to {}",
            report.written,
            report.skipped.len(),
            args.output
        ),
    );
    Ok(())
}

fn main() -> Result<(), scextract::Error> {
    env_logger::Builder::from_default_env().init();
    let cli = Cli::parse();
    let progress = make_progress();
    match cli.command {
        Commands::Segment(args) => run_segment(args, &*progress)?,
        Commands::SegmentDl(args) => run_segment_dl(args, &*progress)?,
        Commands::Extract(args) => run_extract(args, &*progress)?,
    }
    Ok(())
}
