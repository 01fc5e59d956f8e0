use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};

use phoneseg_common::{
    BatchSource, Config, LabeledDataset, Prefetcher, SupervisedBatch, UnlabeledDataset,
    UnsupervisedBatch, Vocab,
};
use phoneseg_core::{select_device, FrameSegmenter};
use phoneseg_infer::{detector_by_name, discover_test_corpus, ForcedAligner, LoadedModel};
use phoneseg_train::{
    tags, CheckpointManager, CsvSink, FanoutSink, MetricsSink, TestRunner, Trainer,
    TrainingLoop, TracingSink, ValidationRunner,
};

#[derive(Parser, Debug)]
#[command(name = "phoneseg", about = "Semi-supervised phoneme segmentation trainer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default configuration file.
    InitConfig(InitConfigArgs),
    /// Train from labeled + unlabeled data with periodic validation, testing and checkpoints.
    Train(TrainArgs),
    /// Evaluate a checkpoint on the validation split.
    Validate(EvalArgs),
    /// Run full inference of a checkpoint over the test corpus.
    Test(TestArgs),
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long)]
    max_steps: Option<usize>,
    /// cpu, cuda, cuda:N, metal or auto.
    #[arg(long)]
    device: Option<String>,
    /// Overrides both `ckpt_dir` and `log_dir` (as `<dir>/ckpt`, `<dir>/runs`).
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    no_progress: bool,
}

#[derive(Parser, Debug)]
struct EvalArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long)]
    device: Option<String>,
}

#[derive(Parser, Debug)]
struct TestArgs {
    #[command(flatten)]
    eval: EvalArgs,
    /// Post-processing applied to every alignment.
    #[arg(long, default_value = "none")]
    detector: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig(args) => cmd_init_config(args),
        Command::Train(args) => cmd_train(args),
        Command::Validate(args) => cmd_validate(args),
        Command::Test(args) => cmd_test(args),
    }
}

// ── Init config ────────────────────────────────────────────────────────────────

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() {
        anyhow::bail!("{} already exists", args.output.display());
    }
    Config::default().save(&args.output)?;
    tracing::info!(path = %args.output.display(), "Wrote default config");
    Ok(())
}

// ── Train ──────────────────────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    if let Some(max_steps) = args.max_steps {
        config.train.max_steps = max_steps;
    }
    if let Some(device) = args.device {
        config.train.device = device;
    }
    if let Some(dir) = args.output_dir {
        config.train.ckpt_dir = dir.join("ckpt");
        config.train.log_dir = dir.join("runs");
    }
    config.validate()?;
    let t = &config.train;

    let device = select_device(&t.device)?;
    seed_device(&device, t.random_seed);
    tracing::info!(device = ?device, max_steps = t.max_steps, "Starting training");

    let data_dir = &config.data.data_dir;
    let train_sup = LabeledDataset::load_split(data_dir, "train")?;
    let train_usp = UnlabeledDataset::load_split(data_dir, "train")?;
    let valid = LabeledDataset::load_split(data_dir, "valid")?;
    tracing::info!(
        labeled = train_sup.samples().len(),
        unlabeled = train_usp.samples().len(),
        valid = valid.samples().len(),
        "Datasets loaded"
    );

    let sup = BatchSource::shuffled(train_sup, t.batch_size_sup, t.random_seed)?;
    let usp = BatchSource::shuffled(train_usp, t.batch_size_usp, t.random_seed.wrapping_add(1))?;
    let mut sup: Prefetcher<SupervisedBatch> = Prefetcher::spawn(sup, t.prefetch_batches);
    let mut usp: Prefetcher<UnsupervisedBatch> = Prefetcher::spawn(usp, t.prefetch_batches);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = FrameSegmenter::new(vb, &config.model)?;
    let trainer = Trainer::new(model, varmap, t, device.clone())?;

    let validation = ValidationRunner::new(valid, t.batch_size_sup, t.label_smoothing, device.clone());
    let checkpoints = CheckpointManager::new(&t.ckpt_dir, &t.model_name, &config)?;
    let mut lp = TrainingLoop::new(trainer, t)
        .with_validation(validation)
        .with_checkpoints(checkpoints)
        .with_progress(!args.no_progress);

    let test_corpus = discover_test_corpus(&data_dir.join("test"))?;
    if test_corpus.is_empty() {
        tracing::warn!("No test transcriptions found; test pass disabled");
    } else {
        let vocab = Vocab::load(&config.data.vocab)?;
        let aligner = ForcedAligner::new(vocab, config.data.frame_seconds, device.clone());
        lp = lp.with_test(TestRunner::new(test_corpus)?, Box::new(aligner));
    }

    let sinks: Vec<Box<dyn MetricsSink>> = vec![
        Box::new(TracingSink),
        Box::new(CsvSink::create(&t.log_dir)?),
    ];
    let mut sink = FanoutSink::new(sinks);
    let summary = lp.run(&mut sup, &mut usp, &mut sink)?;

    std::fs::write(
        t.log_dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    tracing::info!(
        steps = summary.steps,
        checkpoints = summary.checkpoints.len(),
        validation_failures = summary.validation_failures,
        test_failures = summary.test_failures,
        checkpoint_failures = summary.checkpoint_failures,
        "Training done"
    );
    Ok(())
}

/// CPU has no global seed in candle; that case is only logged.
fn seed_device(device: &Device, seed: u64) {
    if let Err(e) = device.set_seed(seed) {
        tracing::debug!(error = %e, "Device seed not set");
    }
}

// ── Validate ───────────────────────────────────────────────────────────────────

fn load_for_eval(args: &EvalArgs) -> Result<(Config, Device, LoadedModel)> {
    let mut config = Config::load(&args.config)?;
    if let Some(device) = &args.device {
        config.train.device = device.clone();
    }
    let device = select_device(&config.train.device)?;
    let loaded = LoadedModel::load(&config.model, &args.checkpoint, &device)?;
    Ok((config, device, loaded))
}

fn cmd_validate(args: EvalArgs) -> Result<()> {
    let (config, device, mut loaded) = load_for_eval(&args)?;
    let valid = LabeledDataset::load_split(&config.data.data_dir, "valid")?;
    let runner = ValidationRunner::new(
        valid,
        config.train.batch_size_sup,
        config.train.label_smoothing,
        device,
    );
    let metrics = runner.run(&mut loaded.model)?;
    for (tag, value) in metrics.scalars() {
        println!("{tag}\t{value:.6}");
    }
    Ok(())
}

// ── Test ───────────────────────────────────────────────────────────────────────

fn cmd_test(args: TestArgs) -> Result<()> {
    let (config, device, mut loaded) = load_for_eval(&args.eval)?;
    let corpus = discover_test_corpus(&config.data.data_dir.join("test"))?;
    let runner = TestRunner::new(corpus)?.with_detector(detector_by_name(&args.detector)?);
    let vocab = Vocab::load(&config.data.vocab)?;
    let aligner = ForcedAligner::new(vocab, config.data.frame_seconds, device);

    let report = runner.run(&mut loaded.model, &aligner, true)?;
    let figure_dir = config.train.log_dir.join("test");
    let mut sink = CsvSink::create(&figure_dir)?;
    sink.scalar(tags::TEST_CONFIDENCE, report.mean_confidence as f64, 0)?;
    for (tag, figure) in &report.figures {
        sink.figure(tag, figure, 0)?;
    }
    sink.flush()?;

    for (sample, prediction) in runner.samples().iter().zip(&report.predictions) {
        let intervals: Vec<String> = prediction
            .ph_seq
            .iter()
            .zip(&prediction.ph_intervals)
            .map(|(ph, [s, e])| format!("{ph}:{s:.3}-{e:.3}"))
            .collect();
        println!("{}\t{}", display(&sample.audio), intervals.join(" "));
    }
    println!("{}\t{:.4}", tags::TEST_CONFIDENCE, report.mean_confidence);
    Ok(())
}

fn display(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
