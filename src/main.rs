mod cli;
mod inputs;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, CompressArgs};

use pics_common::{CompressionRequest, EngineConfig, Outcome, ResizeSpec, Settings, Status};
use pics_engine::{
    BatchOrchestrator, BatchReport, CancellationToken, EngineServices, FanoutSink, ProgressSender,
    StatsSink, StatsStore,
};
use pics_tools::{Sandbox, ToolRegistry};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "pics=debug,pics_engine=debug,pics_tools=debug,pics_codec=debug,pics_common=debug"
                .to_string()
        } else {
            "pics=info,pics_engine=warn,pics_tools=warn,pics_codec=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Compress(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(compress(args, cli.config.as_deref()))
        }
        Commands::CheckTools => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(check_tools())
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("pics {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn compress(args: CompressArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = EngineConfig::load_or_default(config_path);
    if let Some(log) = &args.log {
        config.log.path = Some(log.clone());
    }
    for warning in config.validate() {
        tracing::warn!("config: {warning}");
    }

    let settings = Arc::new(build_settings(&args)?);
    let inputs = inputs::collect(&args.paths);
    if inputs.files.is_empty() {
        anyhow::bail!("No image files found in the given paths");
    }
    tracing::info!("Compressing {} file(s)", inputs.files.len());

    let mut services = EngineServices::from_config(config, &inputs.roots)?;
    if let Some(stats) = &args.stats {
        let store: Arc<dyn StatsSink> = Arc::new(StatsStore::with_file(stats));
        services.sink = Arc::new(FanoutSink::new(vec![services.sink.clone(), store]));
    }
    let orchestrator = BatchOrchestrator::new(services);

    let requests: Vec<_> = inputs
        .files
        .into_iter()
        .map(|path| CompressionRequest::with_shared_settings(path, Arc::clone(&settings)))
        .collect();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; finishing files in flight");
            on_signal.cancel();
        }
    });

    let progress = ProgressSender::new(|p| {
        if let Some(file) = &p.current_file {
            tracing::debug!("[{}/{}] {}", p.processed, p.total, file);
        }
    });

    let report = orchestrator
        .run(requests, args.jobs, &progress, &cancel)
        .await;

    if args.json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    if report.summary.failed > 0 {
        anyhow::bail!("{} file(s) failed", report.summary.failed);
    }
    Ok(())
}

/// Settings file (if any) overridden by flags.
fn build_settings(args: &CompressArgs) -> Result<Settings> {
    let mut settings = match &args.settings {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings file {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse settings file {}", path.display()))?
        }
        None => Settings::default(),
    };

    if let Some(preset) = args.preset {
        settings.preset = preset;
    }
    if let Some(mode) = args.save_mode {
        settings.save_mode = mode;
    }
    if args.no_gifsicle {
        settings.enable_gifsicle = false;
    }
    if args.gif_lossy {
        settings.enable_gif_lossy = true;
    }
    if let Some(target) = args.resize {
        settings.resize = ResizeSpec {
            enabled: true,
            target_pixels: target,
            condition: args.resize_condition,
        };
    }
    if args.srgb {
        settings.convert_to_srgb = true;
    }
    if args.strip_metadata {
        settings.preserve_metadata = false;
    }
    Ok(settings)
}

fn print_json(report: &BatchReport) -> Result<()> {
    let value = serde_json::json!({
        "batchId": report.batch_id.to_string(),
        "summary": report.summary,
        "outcomes": report.outcomes,
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        println!("{}", describe(outcome));
    }
    let s = &report.summary;
    println!();
    println!(
        "{} compressed, {} skipped, {} failed; saved {} ({:.1}%)",
        s.succeeded,
        s.skipped,
        s.failed,
        human_bytes(s.bytes_saved),
        s.saved_ratio() * 100.0
    );
    if s.cancelled > 0 {
        println!("{} file(s) not started because the batch was cancelled", s.cancelled);
    }
}

fn describe(outcome: &Outcome) -> String {
    let name = outcome.original_path().display();
    match outcome.status() {
        Status::Success if outcome.is_no_gain() => format!("= {name}: already optimal"),
        Status::Success => format!(
            "✓ {name}: {} → {} (-{:.1}%) [{}]",
            human_bytes(outcome.original_size_bytes()),
            human_bytes(outcome.new_size_bytes()),
            outcome.saved_ratio() * 100.0,
            outcome.reason()
        ),
        Status::Skipped => format!("- {name}: skipped ({})", outcome.reason()),
        Status::Error => format!("✗ {name}: {}", outcome.reason()),
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

async fn check_tools() -> Result<()> {
    println!("Checking external tools...\n");

    let registry = ToolRegistry::new();
    let tools = registry.check_all(&Arc::new(Sandbox::default())).await;
    let mut all_ok = true;

    for info in &tools {
        let status = if info.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, info.tool);

        if let Some(ref version) = info.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = info.path {
            print!(" - {}", path.display());
        }
        if info.source == Some("env") {
            print!(" [{}]", info.tool.env_var());
        }

        println!();
    }

    println!();
    let webp = if pics_codec_available() { "available" } else { "unavailable" };
    println!("Embedded WebP codec: {webp}");
    println!();
    if all_ok {
        println!("All external tools are available!");
    } else {
        println!("Some tools are missing. Built-in codecs will be used where possible.");
        for hint in registry.availability().install_hints() {
            println!("  {hint}");
        }
    }

    Ok(())
}

fn pics_codec_available() -> bool {
    pics_codec::CodecBridge::new().availability(pics_common::ImageFormat::WebP)
        == pics_codec::CodecAvailability::Embedded
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = EngineConfig::load(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            EngineConfig::default()
        }
    };

    println!("  Concurrency: {}", config.effective_concurrency());
    println!(
        "  File size limits: {} .. {}",
        human_bytes(config.min_file_size_bytes),
        human_bytes(config.max_file_size_bytes)
    );
    match &config.log.path {
        Some(log) => println!(
            "  Log: {} (rotate at {}, keep {})",
            log.display(),
            human_bytes(config.log.max_size_bytes),
            config.log.max_files
        ),
        None => println!("  Log: disabled"),
    }

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for w in &warnings {
            println!("  ! {w}");
        }
    }

    Ok(())
}
