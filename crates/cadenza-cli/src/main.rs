//! Cadenza CLI - dispatch live-coding fragments to Sonic Pi
//!
//! Usage:
//!   cadenza init                      Write .cadenza/config.toml and sample fragments
//!   cadenza setup                     Print the listen loop to paste into Sonic Pi
//!   cadenza send <file>               Dispatch one fragment and report the outcome
//!   cadenza run <fragments-dir>       Run every phase from a directory of fragments
//!   cadenza listen                    Print feedback messages as they arrive
//!   cadenza emulate                   Stand in for Sonic Pi on the engine port
//!   cadenza record start|stop|save    Control Sonic Pi recording

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use cadenza_bridge::{
    listen_loop_snippet, CodeTransport, CommandDispatcher, DispatchResolution, DispatcherSettings,
    EngineProfile, FeedbackListener, FeedbackSink, OscMessage, Reply, UdpFeedbackSource,
    UdpLoopbackEngine, UdpTransport,
};
use cadenza_core::fail_open::{fail_open, fail_open_with_retries};
use cadenza_core::{CadenzaConfig, FragmentSpec, Phase};
use cadenza_pipeline::{
    normalize_fragment, DirectoryGenerator, PhasePlan, Pipeline, PipelineSnapshot, RetryDecision,
    Status,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "cadenza")]
#[command(author, version, about = "Dispatch live-coding fragments to Sonic Pi")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project directory holding .cadenza/config.toml
    #[arg(short, long, default_value = ".", global = true)]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default configuration and sample fragments
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Print the Sonic Pi listen loop
    Setup,

    /// Dispatch one fragment file
    Send {
        file: PathBuf,

        /// Phase to tag the fragment with
        #[arg(long, default_value = "generation")]
        phase: Phase,
    },

    /// Run the pipeline over a directory of fragments
    Run {
        /// Directory with <phase>.rb or <phase>-<cycle>.rb files
        fragments: PathBuf,

        /// Write the code version log as JSON
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,

        /// Record the session and save it under this file name
        #[arg(long, value_name = "FILE")]
        record: Option<String>,

        /// Retry a blocked cycle this many times before giving up
        #[arg(long, default_value = "0")]
        retry_blocked: u32,

        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print feedback messages until interrupted
    Listen,

    /// Answer fragments like Sonic Pi would (for trying things without it)
    Emulate {
        /// Report an error for fragments containing this text
        #[arg(long)]
        fail_on: Option<String>,
    },

    /// Control Sonic Pi recording
    Record {
        #[command(subcommand)]
        action: RecordCommands,
    },
}

#[derive(Subcommand)]
enum RecordCommands {
    Start,
    Stop,
    /// Save the last recording
    Save { file: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let project = cli.project;
    match cli.command {
        Commands::Init { force } => cmd_init(&project, force).await,
        Commands::Setup => cmd_setup(&project),
        Commands::Send { file, phase } => cmd_send(&project, file, phase).await,
        Commands::Run {
            fragments,
            export,
            record,
            retry_blocked,
            json,
        } => cmd_run(&project, fragments, export, record, retry_blocked, json).await,
        Commands::Listen => cmd_listen(&project).await,
        Commands::Emulate { fail_on } => cmd_emulate(&project, fail_on).await,
        Commands::Record { action } => cmd_record(&project, action).await,
    }
}

fn load_config(project: &Path) -> Result<CadenzaConfig> {
    CadenzaConfig::load_or_default(project)
        .with_context(|| format!("Failed to load configuration from {}", project.display()))
}

async fn connect(config: &CadenzaConfig) -> Result<UdpTransport> {
    UdpTransport::connect(&config.engine)
        .await
        .with_context(|| format!("Failed to reach engine at {}", config.engine.address()))
}

async fn cmd_init(project: &Path, force: bool) -> Result<()> {
    let config_path = project.join(".cadenza/config.toml");
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    CadenzaConfig::write_default(project).context("Failed to write configuration")?;

    let fragments = project.join("fragments");
    tokio::fs::create_dir_all(&fragments).await?;
    let samples = [
        (Phase::Initialization, "use_bpm 120\n"),
        (Phase::Generation, "use_synth :tb303\nplay :e2, release: 0.3\nsleep 0.5\n"),
        (Phase::Arrangement, "sample :loop_amen\nsleep 2\n"),
        (Phase::Mixing, "set_volume! 0.8\n"),
        (Phase::Finalization, "play :e2, release: 2\n"),
    ];
    for (phase, text) in samples {
        let path = fragments.join(format!("{}.rb", phase));
        if !path.exists() {
            tokio::fs::write(&path, text).await?;
        }
    }

    println!("Initialized Cadenza in {}", project.display());
    println!("Created:");
    println!("  .cadenza/config.toml");
    println!("  fragments/");
    println!("\nNext: run `cadenza setup` and paste the listen loop into Sonic Pi.");
    Ok(())
}

fn cmd_setup(project: &Path) -> Result<()> {
    let config = load_config(project)?;
    println!("# Paste into a Sonic Pi buffer and press Run.");
    println!(
        "# Cadenza sends code to {} and listens on {}.",
        config.engine.address(),
        config.feedback.bind
    );
    println!();
    print!("{}", listen_loop_snippet(&config));
    Ok(())
}

async fn cmd_send(project: &Path, file: PathBuf, phase: Phase) -> Result<()> {
    let config = load_config(project)?;
    let code = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let code = if config.pipeline.normalize_fragments {
        normalize_fragment(&code)
    } else {
        code
    };

    let source = UdpFeedbackSource::bind(&config.feedback).await?;
    let dispatcher = Arc::new(CommandDispatcher::new(
        connect(&config).await?,
        DispatcherSettings::from_config(&config),
    ));
    let listener = FeedbackListener::spawn(source, dispatcher.clone());

    let resolution = dispatcher
        .dispatch_with_retry(&FragmentSpec::new(phase, 0, code))
        .await?;
    listener.shutdown().await;

    match resolution {
        DispatchResolution::Succeeded { attempts, .. } => {
            println!("Executed successfully ({} attempt(s))", attempts);
            Ok(())
        }
        DispatchResolution::Exhausted { last_error, ids } => {
            bail!("Failed after {} attempt(s): {}", ids.len(), last_error)
        }
    }
}

async fn cmd_run(
    project: &Path,
    fragments: PathBuf,
    export: Option<PathBuf>,
    record: Option<String>,
    retry_blocked: u32,
    json: bool,
) -> Result<()> {
    let config = load_config(project)?;
    if !fragments.is_dir() {
        bail!("{} is not a directory", fragments.display());
    }

    let source = UdpFeedbackSource::bind(&config.feedback).await?;
    let dispatcher = Arc::new(CommandDispatcher::new(
        connect(&config).await?,
        DispatcherSettings::from_config(&config),
    ));
    let mut pipeline = Pipeline::new(
        dispatcher.clone(),
        DirectoryGenerator::new(fragments),
        PhasePlan::from_config(&config.pipeline),
    )
    .with_normalization(config.pipeline.normalize_fragments);
    pipeline.spawn_listener(source);
    info!(run = %pipeline.run_id(), "Pipeline created");

    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current cycle");
            cancel.cancel();
        }
    });

    let transport = dispatcher.transport();
    if record.is_some() {
        let start = OscMessage::start_recording();
        fail_open("recording::start", transport.send(&start)).await;
    }

    let mut snapshot = pipeline.run().await?;
    let mut retries_left = retry_blocked;
    while snapshot.blocked && retries_left > 0 {
        retries_left -= 1;
        info!(remaining = retries_left, "Retrying blocked cycle");
        pipeline.retry(RetryDecision::Same).await?;
        snapshot = pipeline.run().await?;
    }

    if let Some(file) = record {
        let stop = OscMessage::stop_recording();
        fail_open("recording::stop", transport.send(&stop)).await;
        let save = OscMessage::save_recording(file);
        fail_open_with_retries("recording::save", 3, Duration::from_millis(200), || {
            transport.send(&save)
        })
        .await;
    }

    if let Some(path) = export {
        fail_open("export::write", pipeline.write_export(&path)).await;
    }

    let (snapshot, _) = pipeline.close().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_summary(&snapshot);
    }

    match snapshot.status {
        Status::Complete | Status::Cancelled => Ok(()),
        Status::Blocked { reason } => bail!(
            "Blocked in {} cycle {}: {}",
            snapshot.phase,
            snapshot.cycle,
            reason
        ),
        Status::Running => bail!("Pipeline stopped while still running"),
    }
}

fn print_summary(snapshot: &PipelineSnapshot) {
    println!("Run {}: {}", snapshot.run_id, snapshot.status);
    let completed: Vec<String> = snapshot.completed.iter().map(|p| p.to_string()).collect();
    println!("Completed phases: {}", completed.join(", "));
    println!("\nDispatches:");
    for (i, entry) in snapshot.entries.iter().enumerate() {
        let first_line = entry.code_text.lines().next().unwrap_or("");
        println!(
            "  {:>3}. {:<14} cycle {:<2} {:<10} {}",
            i + 1,
            entry.phase,
            entry.cycle,
            entry.outcome,
            first_line
        );
    }
}

/// Prints every payload; nothing is outstanding so nothing is correlated
struct PrintSink;

#[async_trait]
impl FeedbackSink for PrintSink {
    async fn deliver(&self, payload: String) {
        println!("{}", payload);
    }
}

async fn cmd_listen(project: &Path) -> Result<()> {
    let config = load_config(project)?;
    let source = UdpFeedbackSource::bind(&config.feedback).await?;
    let listener = FeedbackListener::spawn(source, Arc::new(PrintSink));

    println!("Listening on {} (Ctrl-C to stop)", listener.description());
    tokio::signal::ctrl_c().await?;

    let stats = listener.shutdown().await;
    println!(
        "\n{} message(s), {} unreadable datagram(s)",
        stats.delivered, stats.errors
    );
    Ok(())
}

async fn cmd_emulate(project: &Path, fail_on: Option<String>) -> Result<()> {
    let config = load_config(project)?;
    let feedback_addr = tokio::net::lookup_host(&config.feedback.bind)
        .await?
        .next()
        .with_context(|| format!("No address for {}", config.feedback.bind))?;

    let sandbox = move |code: &str| match &fail_on {
        Some(pattern) if code.contains(pattern.as_str()) => {
            Reply::Error(format!("Emulated error: fragment contains {}", pattern))
        }
        _ => Reply::Success,
    };
    let engine = UdpLoopbackEngine::start(
        &config.engine.address(),
        sandbox,
        EngineProfile::from_config(&config),
        feedback_addr,
    )
    .await?;

    println!(
        "Emulating Sonic Pi on {}, replying to {} (Ctrl-C to stop)",
        engine.local_addr(),
        feedback_addr
    );
    tokio::signal::ctrl_c().await?;

    let evaluated = engine.stop().await;
    println!("\nEvaluated {} fragment(s)", evaluated);
    Ok(())
}

async fn cmd_record(project: &Path, action: RecordCommands) -> Result<()> {
    let config = load_config(project)?;
    let transport = connect(&config).await?;

    let message = match &action {
        RecordCommands::Start => OscMessage::start_recording(),
        RecordCommands::Stop => OscMessage::stop_recording(),
        RecordCommands::Save { file } => OscMessage::save_recording(file.as_str()),
    };
    transport
        .send(&message)
        .await
        .with_context(|| format!("Failed to send {}", message.path))?;

    println!("Sent {} to {}", message.path, transport.target());
    Ok(())
}
