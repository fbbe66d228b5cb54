// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! classq: batch classification of underwater event images
//!
//! Drives the classifier library through a single background queue and runs
//! event files through import, transcode, classify, export and cleanup.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use classq::batch::{BatchEvent, BatchRunner, BatchSettings, BatchSummary, CommandStages};
use classq::config::{platform_flag, AppConfig};
use classq::library::{ClassModel, ColorSpace, DebugLibrary, TrainRequest, TrainingModel, VotingMethod};
use classq::queue::{QueueOptions, TaskQueue};
use classq::results::ResultsLedger;
use classq::tasks::{
    CollectClassTask, DeleteClassTask, LoadModelsTask, LoadedModels, TestClassTask, TrainClassesTask,
};
use classq::{ClassifierTask, TaskOutcome};

/// classq CLI - serialized image classification of video events
#[derive(Parser, Debug)]
#[command(name = "classq")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Queue-driven image classification of video events", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify the events of one or more event files
    Batch {
        /// Event XML files or glob patterns
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Training library (overrides config)
        #[arg(short, long)]
        training: Option<String>,

        /// Output directory (overrides config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Voting method: majority, probability or max-probability
        #[arg(long)]
        voting: Option<VotingMethod>,

        /// Minimum class probability (0.0-1.0)
        #[arg(long)]
        min_prob: Option<f32>,

        /// Echo the classifier log while the batch runs
        #[arg(long)]
        follow_log: bool,
    },

    /// List collected classes and training libraries
    Models,

    /// Collect a class from a directory of example images
    Collect {
        /// Class name
        name: String,

        /// Directory of example images
        dir: PathBuf,

        /// Knowledge-base concept of the class
        #[arg(long)]
        concept: Option<String>,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "rgb", value_parser = parse_color_space)]
        color_space: ColorSpace,
    },

    /// Delete a collected class
    Delete {
        name: String,

        #[arg(long, default_value = "rgb", value_parser = parse_color_space)]
        color_space: ColorSpace,
    },

    /// Train a library from collected classes
    Train {
        /// Name of the new training library
        alias: String,

        /// Classes to train, comma separated (at least two)
        #[arg(short = 'C', long, value_delimiter = ',', required = true)]
        classes: Vec<String>,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "rgb", value_parser = parse_color_space)]
        color_space: ColorSpace,
    },

    /// Test a collected class against a training library
    TestClass {
        /// Class to test
        class: String,

        /// Training library to test against
        #[arg(short, long)]
        training: String,

        /// Minimum class probability (0.0-1.0)
        #[arg(long)]
        min_prob: Option<f32>,
    },

    /// Follow the classifier log until Ctrl+C
    Log,

    /// Show recent batch results
    Results {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Output directory (overrides config)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Initialize a new classq workspace
    Init {
        /// Directory to initialize (default: current)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

fn parse_color_space(s: &str) -> Result<ColorSpace, String> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
        .map_err(|_| format!("unknown color space: {} (rgb, ycbcr, gray)", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    debug!("classq v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;

    match cli.command {
        Commands::Batch { inputs, training, output, voting, min_prob, follow_log } => {
            run_batch(config, inputs, training, output, voting, min_prob, follow_log).await
        }
        Commands::Models => run_models(config).await,
        Commands::Collect { name, dir, concept, description, color_space } => {
            run_collect(config, name, dir, concept, description, color_space).await
        }
        Commands::Delete { name, color_space } => run_delete(config, name, color_space).await,
        Commands::Train { alias, classes, description, color_space } => {
            run_train(config, alias, classes, description, color_space).await
        }
        Commands::TestClass { class, training, min_prob } => {
            run_test_class(config, class, training, min_prob).await
        }
        Commands::Log => run_log(config).await,
        Commands::Results { count, output } => run_results(config, count, output),
        Commands::Config { action } => run_config_command(config, action, &cli.config),
        Commands::Init { dir, force } => run_init(dir, force),
    }
}

/// Start the queue over the configured classifier backend
fn start_queue(config: &AppConfig) -> anyhow::Result<Arc<TaskQueue>> {
    if !config.classifier.debug_library {
        bail!("no native classifier library is linked into this build; set classifier.debug_library to true");
    }
    let options = QueueOptions::from(&config.classifier);
    info!(
        "Classifier log: {:?} (platform flag {})",
        options.log_path,
        platform_flag()
    );
    Ok(Arc::new(TaskQueue::start(DebugLibrary::new(), options)?))
}

/// Submit one task and wait for its output
async fn submit_and_wait<T: ClassifierTask>(queue: &TaskQueue, task: T) -> anyhow::Result<T::Output> {
    let handle = queue.submit(task)?;
    match handle.wait().await {
        TaskOutcome::Succeeded => handle
            .take_output()
            .ok_or_else(|| anyhow!("{} produced no output", handle.name())),
        TaskOutcome::Failed(reason) => bail!("{} failed: {}", handle.name(), reason),
        TaskOutcome::Cancelled => bail!("{} was cancelled", handle.name()),
    }
}

async fn load_models(queue: &TaskQueue, config: &AppConfig) -> anyhow::Result<LoadedModels> {
    submit_and_wait(queue, LoadModelsTask::new(Path::new(&config.classifier.database_root))).await
}

async fn find_training(queue: &TaskQueue, config: &AppConfig, name: &str) -> anyhow::Result<TrainingModel> {
    let models = load_models(queue, config).await?;
    models
        .training(name)
        .cloned()
        .ok_or_else(|| anyhow!("training library '{}' not found under {}", name, config.classifier.database_root))
}

/// Expand file names and glob patterns, keeping their order
fn expand_inputs(inputs: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for input in inputs {
        if !input.contains(['*', '?', '[']) {
            paths.push(PathBuf::from(input));
            continue;
        }
        let mut matched: Vec<PathBuf> = glob::glob(input)
            .with_context(|| format!("bad pattern {}", input))?
            .filter_map(|entry| entry.ok())
            .collect();
        if matched.is_empty() {
            warn!("No files match {}", input);
        }
        matched.sort();
        paths.extend(matched);
    }
    Ok(paths)
}

/// Stop signal raised by Ctrl+C or SIGTERM
fn shutdown_signal() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, stopping..."),
            _ = terminate => info!("Received SIGTERM, stopping..."),
        }

        let _ = shutdown_tx.send(true);
    });

    shutdown_rx
}

async fn run_batch(
    mut config: AppConfig,
    inputs: Vec<String>,
    training: Option<String>,
    output: Option<PathBuf>,
    voting: Option<VotingMethod>,
    min_prob: Option<f32>,
    follow_log: bool,
) -> anyhow::Result<()> {
    if let Some(output) = output {
        config.batch.output_dir = output.to_string_lossy().to_string();
    }
    if let Some(voting) = voting {
        config.batch.voting_method = voting;
    }
    if let Some(min_prob) = min_prob {
        config.batch.min_prob_threshold = min_prob;
    }
    config.validate()?;

    let sources = expand_inputs(&inputs)?;
    let queue = start_queue(&config)?;

    let training_name = training
        .or_else(|| config.batch.training_model.clone())
        .ok_or_else(|| anyhow!("no training library given; use --training or batch.training_model"))?;
    let training = find_training(&queue, &config, &training_name).await?;

    let stages = Arc::new(CommandStages::new(
        config.stages.clone(),
        Path::new(&config.classifier.scratch_dir),
    ));
    let runner = Arc::new(BatchRunner::new(
        Arc::clone(&queue),
        stages,
        BatchSettings::from_config(&config, Some(training)),
    )?);
    runner.set_sources(sources);

    let summary = drive_batch(&queue, runner, follow_log).await;
    queue.shutdown();

    let summary = summary?;
    println!(
        "\nBatch finished: {} done, {} failed, {} stopped, {} skipped",
        summary.done, summary.failed, summary.stopped, summary.skipped
    );
    if summary.aborted {
        bail!("batch stopped before all items ran");
    }
    Ok(())
}

/// Run the batch, echoing its events until it ends
async fn drive_batch(
    queue: &TaskQueue,
    runner: Arc<BatchRunner>,
    follow_log: bool,
) -> anyhow::Result<BatchSummary> {
    // a refused run never sends Finished
    runner.validate()?;

    // Status and notices
    let mut events = runner.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BatchEvent::StatusChanged { source, status, .. } => {
                    println!("{}: {}", source.display(), status);
                }
                BatchEvent::Notice(notice) => println!("{}", notice),
                BatchEvent::Finished(_) => break,
            }
        }
    });

    // Ctrl+C stops the batch
    let mut shutdown_rx = shutdown_signal();
    let stopper = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            if shutdown_rx.wait_for(|stop| *stop).await.is_ok() {
                runner.stop();
            }
        })
    };

    let (log_stop_tx, log_stop_rx) = watch::channel(false);
    let log_task = if follow_log {
        let reader = queue.log_reader()?;
        Some(tokio::spawn(reader.follow(Duration::from_millis(500), log_stop_rx, |line| {
            println!("  | {}", line)
        })))
    } else {
        None
    };

    let summary = runner.run().await;

    let _ = log_stop_tx.send(true);
    if let Some(task) = log_task {
        if let Ok(Err(e)) = task.await {
            warn!("Log follower ended: {}", e);
        }
    }
    stopper.abort();
    if summary.is_err() {
        reporter.abort();
    }
    let _ = reporter.await;

    Ok(summary?)
}

async fn run_models(config: AppConfig) -> anyhow::Result<()> {
    let queue = start_queue(&config)?;
    let models = load_models(&queue, &config).await?;
    queue.shutdown();

    println!("Classes ({}):", models.classes.len());
    for class in &models.classes {
        println!("  {} [{:?}] {}", class.name, class.color_space, class.description);
    }
    println!("\nTraining libraries ({}):", models.trainings.len());
    for training in &models.trainings {
        println!("  {} = {}", training.name, training.classes.join(", "));
    }
    Ok(())
}

async fn run_collect(
    config: AppConfig,
    name: String,
    dir: PathBuf,
    concept: Option<String>,
    description: String,
    color_space: ColorSpace,
) -> anyhow::Result<()> {
    let database_root = PathBuf::from(&config.classifier.database_root);
    let class = ClassModel {
        vars_class_name: concept.unwrap_or_else(|| name.clone()),
        squared_image_dir: database_root.join("features").join("class").join(&name),
        raw_image_dir: dir,
        name,
        description,
        color_space,
        database_root,
    };

    let queue = start_queue(&config)?;
    let result = submit_and_wait(&queue, CollectClassTask::new(class)).await;
    queue.shutdown();
    result?;
    println!("Class collected");
    Ok(())
}

async fn run_delete(config: AppConfig, name: String, color_space: ColorSpace) -> anyhow::Result<()> {
    let queue = start_queue(&config)?;
    let task = DeleteClassTask::new(&name, Path::new(&config.classifier.database_root), color_space);
    let result = submit_and_wait(&queue, task).await;
    queue.shutdown();
    result?;
    println!("Deleted class {}", name);
    Ok(())
}

async fn run_train(
    config: AppConfig,
    alias: String,
    classes: Vec<String>,
    description: String,
    color_space: ColorSpace,
) -> anyhow::Result<()> {
    let task = TrainClassesTask::new(TrainRequest {
        classes,
        alias: alias.clone(),
        database_root: PathBuf::from(&config.classifier.database_root),
        description,
        color_space,
    })?;

    let queue = start_queue(&config)?;
    let result = submit_and_wait(&queue, task).await;
    queue.shutdown();
    result?;
    println!("Trained {}", alias);
    Ok(())
}

async fn run_test_class(
    config: AppConfig,
    class: String,
    training: String,
    min_prob: Option<f32>,
) -> anyhow::Result<()> {
    let queue = start_queue(&config)?;
    let result: anyhow::Result<_> = async {
        let training = find_training(&queue, &config, &training).await?;
        let threshold = min_prob.unwrap_or(config.batch.min_prob_threshold);
        submit_and_wait(&queue, TestClassTask::new(training, &class, threshold)).await
    }
    .await;
    queue.shutdown();
    let report = result?;

    println!(
        "{} against {}: {}/{} correct ({:.0}%)",
        report.test_class,
        report.training_model,
        report.correct,
        report.total,
        report.accuracy() * 100.0
    );
    for (label, count) in &report.hits {
        println!("  {}: {}", label, count);
    }
    Ok(())
}

async fn run_log(config: AppConfig) -> anyhow::Result<()> {
    let reader = classq::logtail::LogReader::open_at_end(&config.classifier.log_path())?;
    println!("Following {:?} (Ctrl+C to stop)", reader.path());
    reader
        .follow(Duration::from_millis(500), shutdown_signal(), |line| println!("{}", line))
        .await?;
    Ok(())
}

fn run_results(config: AppConfig, count: usize, output: Option<PathBuf>) -> anyhow::Result<()> {
    let output_dir = output.unwrap_or_else(|| PathBuf::from(&config.batch.output_dir));
    let ledger = ResultsLedger::in_dir(&output_dir);
    let entries = ledger.get_recent(count)?;

    println!("Recent results ({} entries):", entries.len());
    for entry in entries {
        let totals: Vec<String> = entry
            .class_totals
            .iter()
            .map(|(label, n)| format!("{}={}", label, n))
            .collect();
        println!(
            "  {} {} {} [{}] {}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.source.display(),
            entry.status,
            entry.training_model,
            totals.join(" ")
        );
    }
    Ok(())
}

fn run_config_command(config: AppConfig, action: ConfigCommands, config_path: &Path) -> anyhow::Result<()> {
    match action {
        ConfigCommands::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        ConfigCommands::Generate { output } => {
            AppConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            config.validate()?;
            println!("Configuration at {:?} is valid", config_path);
            println!("  Scratch directory: {}", config.classifier.scratch_dir);
            println!("  Database root: {}", config.classifier.database_root);
            println!("  Output directory: {}", config.batch.output_dir);
            println!(
                "  Training library: {}",
                config.batch.training_model.as_deref().unwrap_or("-")
            );
        }
    }

    Ok(())
}

/// Initialize a new classq workspace
fn run_init(dir: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let target = dir.unwrap_or_else(|| PathBuf::from("."));
    let config_path = target.join("config.json");

    if config_path.exists() && !force {
        bail!("config.json already exists. Use --force to overwrite");
    }

    // Create directories
    let database_root = target.join("classifier_db");
    let output_dir = target.join("batch_output");
    std::fs::create_dir_all(database_root.join("features").join("class"))?;
    std::fs::create_dir_all(database_root.join("training").join("class"))?;
    std::fs::create_dir_all(&output_dir)?;

    let mut config = AppConfig::default();
    config.classifier.database_root = database_root.to_string_lossy().to_string();
    config.batch.output_dir = output_dir.to_string_lossy().to_string();
    config.save(&config_path)?;

    println!("classq initialized in {:?}", target);
    println!("\nCreated:");
    println!("  - config.json");
    println!("  - classifier_db/");
    println!("  - batch_output/");
    println!("\nNext steps:");
    println!("  1. Set the stages commands in config.json");
    println!("  2. classq collect <class> <dir>, then classq train <name> -C a,b");
    println!("  3. classq batch --training <name> events/*.xml");

    Ok(())
}
